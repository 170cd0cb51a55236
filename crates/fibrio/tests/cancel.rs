//! Cancellation semantics: timer cancellation, the `first` race, timeouts,
//! and the partial-data rule for cancelled reads.

use std::time::{Duration, Instant};

use fibrio::{fiber, io, net, sleep, Config, Either, Error};

#[test]
fn cancelling_a_sleeping_fiber_resumes_it_promptly() {
    fibrio::run(Config::new(), async {
        let start = Instant::now();
        let sleeper = fibrio::spawn(async { sleep(Duration::from_secs(1)).await });

        sleep(Duration::from_millis(100)).await.unwrap();
        assert!(sleeper.cancel(Error::Cancelled));

        let outcome = sleeper.await;
        let elapsed = start.elapsed();
        assert_eq!(outcome, Err(Error::Cancelled));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(
            elapsed < Duration::from_millis(600),
            "sleeper resumed only after {:?}; its timer entry was not removed",
            elapsed
        );
    })
    .unwrap();
}

#[test]
fn first_returns_the_faster_side_and_cancels_the_loser() {
    fibrio::run(Config::new(), async {
        let start = Instant::now();
        let winner = fiber::first(
            sleep(Duration::from_secs(5)),
            sleep(Duration::from_millis(20)),
        )
        .await;
        assert!(matches!(winner, Either::Right(Ok(()))));
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "the losing 5s sleep must not be waited out"
        );
    })
    .unwrap();
}

#[test]
fn timeout_cuts_off_a_slow_operation() {
    fibrio::run(Config::new(), async {
        let res = fiber::timeout(Duration::from_millis(50), async {
            sleep(Duration::from_secs(5)).await?;
            Ok(42)
        })
        .await;
        assert_eq!(res, Err(Error::TimedOut));

        let res = fiber::timeout(Duration::from_secs(5), async {
            sleep(Duration::from_millis(10)).await?;
            Ok(42)
        })
        .await;
        assert_eq!(res, Ok(42));
    })
    .unwrap();
}

#[test]
fn cancelled_read_keeps_partial_data() {
    fibrio::run(Config::new(), async {
        let (r, w) = net::pipe().unwrap();

        let reader = fibrio::spawn(async move {
            let mut buf = [0u8; 8];
            let res = io::read_exactly(&r, &mut buf).await;
            (res, buf)
        });

        // Feed 3 of the 8 requested bytes, give the retry machine time to
        // absorb them, then cancel the reader mid-request.
        io::write_all(&w, b"abc").await.unwrap();
        sleep(Duration::from_millis(50)).await.unwrap();
        reader.cancel(Error::Cancelled);

        let (res, buf) = reader.await;
        assert_eq!(res, Err(Error::Cancelled));
        // The bytes that did arrive were not discarded.
        assert_eq!(&buf[..3], b"abc");
    })
    .unwrap();
}

#[test]
fn cancel_after_completion_is_a_no_op() {
    fibrio::run(Config::new(), async {
        let (r, w) = net::pipe().unwrap();
        io::write_all(&w, b"ping").await.unwrap();

        let reader = fibrio::spawn(async move {
            let mut buf = [0u8; 4];
            io::read_exactly(&r, &mut buf).await.map(|_| buf)
        });
        let got = reader.await;
        assert_eq!(got, Ok(*b"ping"));
    })
    .unwrap();
}

#[test]
fn cancelled_fiber_fails_new_submissions_immediately() {
    fibrio::run(Config::new(), async {
        let (r, _w) = net::pipe().unwrap();
        let reader = fibrio::spawn(async move {
            // First read is cancelled while in flight; the fiber then
            // tries again and must fail up front without reaching the
            // ring.
            let mut buf = [0u8; 4];
            let first = io::read_exactly(&r, &mut buf).await;
            let second = io::read_exactly(&r, &mut buf).await;
            (first, second)
        });
        sleep(Duration::from_millis(30)).await.unwrap();
        reader.cancel(Error::Cancelled);
        let (first, second) = reader.await;
        assert_eq!(first, Err(Error::Cancelled));
        assert_eq!(second, Err(Error::Cancelled));
    })
    .unwrap();
}
