//! The coroutine primitives driven by a real service loop.

use std::cell::{Cell, RefCell};
use std::future::poll_fn;
use std::rc::Rc;
use std::task::Poll;

use corio::runtime::{async_generator, AsyncMutex};
use corio::{Error, Service};

/// Hands the loop one turn; everything queued ahead of us runs first.
async fn yield_now() {
    let mut yielded = false;
    poll_fn(move |cx| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    })
    .await
}

#[test]
fn spawned_task_yields_its_value() {
    let service = Service::new().unwrap();
    let inner = service.clone();
    let value = service
        .block_on(async move { inner.spawn(async { Ok(40 + 2) }).await })
        .unwrap();
    assert_eq!(value, 42);
}

#[test]
fn task_failures_propagate_to_the_awaiter() {
    let service = Service::new().unwrap();
    let inner = service.clone();
    let result: corio::Result<()> = service.block_on(async move {
        inner
            .spawn(async {
                Err::<(), _>(Error::Parse("boom".into()))
            })
            .await
    });
    assert!(matches!(result, Err(Error::Parse(_))));
}

#[test]
fn dropping_a_task_cancels_its_coroutine() {
    struct SetOnDrop(Rc<Cell<bool>>);
    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    let service = Service::new().unwrap();
    let inner = service.clone();
    let dropped = Rc::new(Cell::new(false));
    let flag = dropped.clone();
    service
        .block_on(async move {
            let task = inner.spawn(async move {
                let _guard = SetOnDrop(flag);
                std::future::pending::<()>().await;
                Ok(())
            });
            yield_now().await;
            drop(task);
            Ok(())
        })
        .unwrap();
    assert!(dropped.get());
}

#[test]
fn mutex_critical_sections_run_in_enqueue_order() {
    let service = Service::new().unwrap();
    let inner = service.clone();
    let order = Rc::new(RefCell::new(Vec::new()));
    let observed = order.clone();
    service
        .block_on(async move {
            let mutex = Rc::new(AsyncMutex::new());
            let counter = Rc::new(Cell::new(0u32));

            // Hold the lock so all eight contenders enqueue, in spawn
            // order, before any of them gets to run its section.
            assert!(mutex.try_lock());
            let mut tasks = Vec::new();
            for id in 0..8 {
                let mutex = mutex.clone();
                let order = order.clone();
                let counter = counter.clone();
                tasks.push(inner.spawn(async move {
                    let _guard = mutex.scoped_lock().await;
                    order.borrow_mut().push(id);
                    counter.set(counter.get() + 1);
                    Ok(())
                }));
            }
            // One turn of the loop parks all eight on the mutex.
            yield_now().await;
            mutex.unlock();
            for task in tasks {
                task.await?;
            }
            assert_eq!(counter.get(), 8);
            Ok(())
        })
        .unwrap();
    assert_eq!(*observed.borrow(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn mutex_is_exclusive() {
    let service = Service::new().unwrap();
    let inner = service.clone();
    service
        .block_on(async move {
            let mutex = Rc::new(AsyncMutex::new());
            let inside = Rc::new(Cell::new(0u32));
            let mut tasks = Vec::new();
            for _ in 0..4 {
                let mutex = mutex.clone();
                let inside = inside.clone();
                tasks.push(inner.spawn(async move {
                    let _guard = mutex.scoped_lock().await;
                    assert_eq!(inside.get(), 0);
                    inside.set(1);
                    yield_now().await;
                    assert_eq!(inside.get(), 1);
                    inside.set(0);
                    Ok(())
                }));
            }
            for task in tasks {
                task.await?;
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn async_generator_hands_values_over_one_at_a_time() {
    let service = Service::new().unwrap();
    service
        .block_on(async move {
            let resumes = Rc::new(Cell::new(0u32));
            let counted = resumes.clone();
            let mut numbers = async_generator(move |y| async move {
                for i in 0..3 {
                    counted.set(counted.get() + 1);
                    y.value(i).await;
                }
                Ok(())
            });
            assert_eq!(numbers.next().await?, Some(0));
            // The producer parks on each yield; it has not run ahead.
            assert_eq!(resumes.get(), 1);
            assert_eq!(numbers.next().await?, Some(1));
            assert_eq!(resumes.get(), 2);
            assert_eq!(numbers.next().await?, Some(2));
            assert_eq!(numbers.next().await?, None);
            assert_eq!(numbers.next().await?, None);
            Ok(())
        })
        .unwrap();
}

#[test]
fn cancelled_async_generator_destroys_its_producer() {
    struct SetOnDrop(Rc<Cell<bool>>);
    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    let service = Service::new().unwrap();
    let destroyed = Rc::new(Cell::new(false));
    let flag = destroyed.clone();
    service
        .block_on(async move {
            let mut numbers = async_generator(move |y| async move {
                let _guard = SetOnDrop(flag);
                for i in 0.. {
                    y.value(i).await;
                }
                Ok(())
            });
            assert_eq!(numbers.next().await?, Some(0));
            drop(numbers);
            Ok(())
        })
        .unwrap();
    assert!(destroyed.get());
}

#[test]
fn async_generator_failure_surfaces_on_the_next_advance() {
    let service = Service::new().unwrap();
    service
        .block_on(async move {
            let mut numbers = async_generator(|y| async move {
                y.value(1u8).await;
                Err(Error::Parse("producer failed".into()))
            });
            assert_eq!(numbers.next().await?, Some(1));
            assert!(matches!(numbers.next().await, Err(Error::Parse(_))));
            assert_eq!(numbers.next().await?, None);
            Ok(())
        })
        .unwrap();
}

#[test]
fn event_handoff_between_tasks() {
    use corio::Event;

    let service = Service::new().unwrap();
    let inner = service.clone();
    service
        .block_on(async move {
            let event = Rc::new(Event::new());
            let seen = Rc::new(Cell::new(false));

            let waiter_event = event.clone();
            let waiter_seen = seen.clone();
            let waiter = inner.spawn(async move {
                waiter_event.wait().await;
                waiter_event.reset();
                waiter_seen.set(true);
                Ok(())
            });

            yield_now().await;
            assert!(!seen.get());
            event.set();
            waiter.await?;
            assert!(seen.get());
            assert!(!event.is_set());
            Ok(())
        })
        .unwrap();
}

#[test]
fn closer_stops_run_from_another_thread() {
    use std::time::Duration;

    let service = Service::new().unwrap();
    let closer = service.closer();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        closer.close();
    });
    service.run(-1).unwrap();
    stopper.join().unwrap();
}

#[test]
fn close_interrupts_block_on() {
    let service = Service::new().unwrap();
    let closer = service.closer();
    let result: corio::Result<()> = service.block_on(async move {
        closer.close();
        std::future::pending::<()>().await;
        Ok(())
    });
    assert!(matches!(result, Err(Error::Closed)));
}
