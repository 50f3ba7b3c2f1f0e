//! A bounded `TupleFifo` makes a producer block once its capacity is full,
//! and resume once the consumer frees slots — the wakeup threshold governs
//! how many freed slots it takes before the producer is woken, not just one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qpipe::{FifoConfig, LocalPagePool, PagePool, TupleFifo};

#[test]
fn producer_blocks_on_full_buffer_and_resumes_after_threshold_frees() {
    // 1 tuple per page (tuple_size == page_size), capacity 2 pages,
    // threshold 2: the producer can fill 2 pages without blocking, then
    // must wait until 2 slots are purged before writing a 3rd.
    let pool: Arc<dyn PagePool> = Arc::new(LocalPagePool::new(4, 4));
    let fifo = Arc::new(TupleFifo::new(pool, 4, FifoConfig::new(4, 2, 2)));

    fifo.append(&[1, 1, 1, 1]).unwrap();
    fifo.append(&[2, 2, 2, 2]).unwrap();

    let blocked = Arc::new(AtomicBool::new(true));
    let producer = Arc::clone(&fifo);
    let blocked_flag = Arc::clone(&blocked);
    let handle = std::thread::spawn(move || {
        producer.append(&[3, 3, 3, 3]).unwrap();
        blocked_flag.store(false, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(30));
    assert!(blocked.load(Ordering::SeqCst), "producer should still be blocked on a full buffer");

    // get_page() purges its page immediately on return (unlike
    // get_tuple_copy, which only purges once the *next* call notices it
    // walked off the end of the page), so each call here frees exactly one
    // slot.
    let page1 = fifo.get_page().unwrap().unwrap();
    assert_eq!(page1.get(0).unwrap().as_slice(), &[1, 1, 1, 1]);
    std::thread::sleep(Duration::from_millis(30));
    assert!(blocked.load(Ordering::SeqCst), "one freed slot is below the wakeup threshold");

    // Freeing a second slot crosses the threshold and wakes the producer.
    let page2 = fifo.get_page().unwrap().unwrap();
    assert_eq!(page2.get(0).unwrap().as_slice(), &[2, 2, 2, 2]);
    handle.join().unwrap();
    assert!(!blocked.load(Ordering::SeqCst));

    fifo.send_eof();
    assert_eq!(fifo.get_tuple_copy().unwrap(), Some(vec![3, 3, 3, 3]));
    assert_eq!(fifo.get_tuple_copy().unwrap(), None);
}
