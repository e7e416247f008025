use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::objlist::Detection;

fn list_numbered(number: u32) -> ObjectList {
    let mut list = ObjectList::new();
    list.add(
        Detection {
            number,
            ..Detection::default()
        },
        None,
    )
    .unwrap();
    list
}

#[test]
fn test_lists_flushed_in_submission_order() {
    const N: u32 = 60;
    let queue = WorkQueue::new(4);
    let mut rng = StdRng::seed_from_u64(11);
    let delays: Vec<u64> = (0..N).map(|_| rng.random_range(0..4)).collect();
    let mut flushed = Vec::new();

    thread::scope(|scope| {
        scope.spawn(|| {
            queue.run_workers(
                3,
                |list: &mut ObjectList| {
                    let detection = list.get_mut(0);
                    thread::sleep(Duration::from_millis(delays[detection.number as usize]));
                    detection.flux = 1.0;
                },
                |seq, list: ObjectList| flushed.push((seq, list.get(0).number, list.get(0).flux)),
            );
        });
        for i in 0..N {
            queue.submit(list_numbered(i)).unwrap();
        }
        queue.shutdown();
    });

    assert_eq!(flushed.len(), N as usize);
    for (i, &(seq, number, flux)) in flushed.iter().enumerate() {
        assert_eq!(seq, i as u64);
        assert_eq!(number, i as u32);
        assert_eq!(flux, 1.0);
    }
}

#[test]
fn test_pending_work_is_drained_on_shutdown() {
    let queue = WorkQueue::new(8);
    for i in 0..5 {
        assert_eq!(queue.submit(list_numbered(i)).unwrap(), i as u64);
    }
    queue.shutdown();

    let mut numbers = Vec::new();
    queue.run_workers(2, |_: &mut ObjectList| {}, |_, list: ObjectList| numbers.push(list.get(0).number));

    assert_eq!(numbers, vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_submit_after_shutdown_fails() {
    let queue = WorkQueue::new(2);
    queue.shutdown();
    assert!(queue.is_closed());
    let err = queue.submit(ObjectList::new()).unwrap_err();
    assert!(matches!(err, Error::QueueClosed));
}

#[test]
fn test_full_queue_blocks_until_shutdown() {
    let queue = WorkQueue::new(1);
    queue.submit(ObjectList::new()).unwrap();
    thread::scope(|scope| {
        let blocked = scope.spawn(|| queue.submit(ObjectList::new()));
        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert!(matches!(blocked.join().unwrap(), Err(Error::QueueClosed)));
    });
}

#[test]
#[should_panic(expected = "queue capacity must be positive")]
fn test_zero_capacity_panics() {
    WorkQueue::new(0);
}

#[test]
fn test_panicking_measure_closes_queue() {
    let queue = WorkQueue::new(1);
    let mut flushed = 0usize;

    let (workers, submitted) = thread::scope(|scope| {
        let workers = scope.spawn(|| {
            queue.run_workers(
                1,
                |_: &mut ObjectList| panic!("measurement failed"),
                |_, _| flushed += 1,
            )
        });
        let submitted: Vec<Result<u64>> = (0..3).map(|i| queue.submit(list_numbered(i))).collect();
        queue.shutdown();
        (workers.join(), submitted)
    });

    assert!(workers.is_err(), "the measurement panic is re-raised");
    assert!(queue.is_closed());
    assert_eq!(submitted[0].as_ref().ok(), Some(&0));
    for result in &submitted[1..] {
        assert!(matches!(result, Err(Error::QueueClosed)));
    }
    assert_eq!(flushed, 0);
}

#[test]
fn test_other_workers_drain_after_panic() {
    let queue = WorkQueue::new(8);
    for i in 0..6 {
        queue.submit(list_numbered(i)).unwrap();
    }
    queue.shutdown();
    let mut numbers = Vec::new();

    let outcome = thread::scope(|scope| {
        scope
            .spawn(|| {
                queue.run_workers(
                    2,
                    |list: &mut ObjectList| {
                        if list.get(0).number == 2 {
                            panic!("measurement failed");
                        }
                    },
                    |_, list: ObjectList| numbers.push(list.get(0).number),
                )
            })
            .join()
    });

    assert!(outcome.is_err());
    // Whatever reached the sink is in submission order without gaps.
    assert_eq!(numbers, (0..numbers.len() as u32).collect::<Vec<_>>());
}
