//! Treiber stack walkthrough: sequential use, contention, and reclamation stats.

use kestrel_stack::{EmptyError, TreiberStack};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::INFO)
        .init();

    println!("Treiber Stack Example");
    println!("=====================\n");

    println!("Single-threaded:");
    {
        let stack = TreiberStack::new();
        stack.push(1);
        stack.push(2);
        stack.push(3);

        assert_eq!(stack.peek(), Some(3));
        assert_eq!(stack.pop(), Ok(3));
        assert_eq!(stack.pop(), Ok(2));
        assert_eq!(stack.pop(), Ok(1));
        assert_eq!(stack.pop(), Err(EmptyError));

        println!("  pushed 1, 2, 3 and popped them back in reverse order");
    }

    println!("\nTwo producers, one drainer:");
    {
        let stack = Arc::new(TreiberStack::new());
        let producers: Vec<_> = [0..1000, 1000..2000]
            .into_iter()
            .map(|range| {
                let stack = stack.clone();
                thread::spawn(move || range.for_each(|i| stack.push(i)))
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }

        let mut drained: Vec<i32> = std::iter::from_fn(|| stack.try_pop()).collect();
        drained.sort_unstable();
        assert_eq!(drained, (0..2000).collect::<Vec<_>>());
        println!("  drained {} distinct values", drained.len());
    }

    println!("\nMixed workload (8 threads, 50000 ops each):");
    {
        let stack = Arc::new(TreiberStack::new());
        let start = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|thread_id| {
                let stack = stack.clone();
                thread::spawn(move || {
                    let mut empty = 0usize;
                    for i in 0..50_000 {
                        if i % 3 == 0 {
                            stack.push(thread_id * 50_000 + i);
                        } else if stack.pop().is_err() {
                            empty += 1;
                        }
                    }
                    empty
                })
            })
            .collect();
        let empty: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let elapsed = start.elapsed();
        let total_ops = 8 * 50_000;
        println!("  {total_ops} operations in {elapsed:?} ({empty} pops found it empty)");
        println!(
            "  throughput: {:.0} ops/sec",
            total_ops as f64 / elapsed.as_secs_f64()
        );
    }

    kestrel::collect();
    println!(
        "\nreclaimer: epoch {}, {} nodes awaiting reclamation",
        kestrel::current_epoch(),
        kestrel::pending()
    );
}
