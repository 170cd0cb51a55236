//! Cross-domain bridge: blocking offload threads and secondary scheduler
//! instances, fanned out and collected by a parent instance.

use std::time::Duration;

use fibrio::{bridge, io, sleep, Config, Error};

#[test]
fn run_raw_offloads_blocking_work() {
    fibrio::run(Config::new(), async {
        let value = bridge::run_raw(|| {
            std::thread::sleep(Duration::from_millis(20));
            6 * 7
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
    })
    .unwrap();
}

#[test]
fn run_raw_keeps_the_scheduler_responsive() {
    fibrio::run(Config::new(), async {
        // A fiber keeps ticking while the bridge thread blocks.
        let ticker = fibrio::spawn(async {
            let mut ticks = 0u32;
            for _ in 0..5 {
                sleep(Duration::from_millis(10)).await?;
                ticks += 1;
            }
            Ok::<u32, Error>(ticks)
        });
        let blocked = bridge::run_raw(|| {
            std::thread::sleep(Duration::from_millis(80));
            "done"
        })
        .await
        .unwrap();
        assert_eq!(blocked, "done");
        assert_eq!(ticker.await.unwrap(), 5);
    })
    .unwrap();
}

#[test]
fn run_raw_propagates_panics() {
    let outcome = std::panic::catch_unwind(|| {
        fibrio::run(Config::new(), async {
            let _: () = bridge::run_raw(|| panic!("bridge worker exploded"))
                .await
                .unwrap();
        })
    });
    assert!(outcome.is_err());
}

#[test]
fn worker_schedulers_fan_out_and_collect() {
    const WORKERS: usize = 4;
    let results = fibrio::run(Config::new(), async {
        let mut handles = Vec::new();
        for i in 0..WORKERS {
            handles.push(fibrio::spawn(async move {
                // Each worker runs a full scheduler instance with its own
                // ring and proves it by doing real ring work.
                bridge::run(move || async move {
                    io::noop().await?;
                    sleep(Duration::from_millis(5)).await?;
                    Ok::<usize, Error>(i * i)
                })
                .await
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }
        results
    })
    .unwrap();
    assert_eq!(results, vec![0, 1, 4, 9]);
}

#[test]
fn nested_instances_run_their_own_rings() {
    fibrio::run(Config::new().queue_depth(8), async {
        let inner = bridge::run(|| async {
            // The inner instance has its own configuration and pool.
            let chunk = fibrio::alloc_fixed_or_wait().await;
            chunk.len()
        })
        .await
        .unwrap();
        assert_eq!(inner, fibrio::Config::from_env().block_size);
    })
    .unwrap();
}
