//! 分段尺寸锁的 Loom 并发模型。
//!
//! ## 教案级导览
//! - **核心目标 (Why)**：验证并发扩容时代计数不会被重复推进，也不会跳过某一代；
//! - **设计手法 (How)**：两个线程同时对空分段租借，`loom::model` 穷举 CAS 成功者与失败者的交错；
//!   失败者让出线程后必须从持锁者压入的空闲栈中取得缓冲，而不是再扩容一代；
//! - **契约 (What)**：每代 2 个缓冲时，两次租借后代数恰为 1，且两个缓冲的代标签都是 `Pooled(0)`。
//!
//! 运行方式：`RUSTFLAGS="--cfg loom" cargo test -p spark-buffer --test loom_segment --release`。

#![cfg(any(loom, spark_loom))]

use std::sync::Arc;

use loom::{model, thread};
use spark_buffer::{Generation, HeapAllocator, SegmentLayout, loom_support};

fn layout(buffers_per_generation: usize, max_generations: u16) -> SegmentLayout {
    SegmentLayout {
        index: 0,
        buffer_size: 16,
        buffers_per_generation,
        max_generations,
    }
}

#[test]
fn concurrent_growers_never_double_advance() {
    model(|| {
        let segment = loom::sync::Arc::new(loom_support::segment(
            layout(2, 4),
            Arc::new(HeapAllocator::new()),
        ));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let segment = segment.clone();
                thread::spawn(move || {
                    segment
                        .acquire(false)
                        .expect("无上限分配器不应失败")
                        .expect("代空间充足")
                })
            })
            .collect();

        let buffers: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("线程不应 panic"))
            .collect();

        assert_eq!(segment.live_generations(), 1, "两次租借只需扩容一代");
        for buffer in &buffers {
            assert_eq!(buffer.tag().generation, Generation::Pooled(0));
        }
        assert_ne!(buffers[0].id(), buffers[1].id());
    });
}

#[test]
fn release_during_shrink_keeps_accounting_consistent() {
    model(|| {
        let segment = loom::sync::Arc::new(loom_support::segment(
            layout(1, 4),
            Arc::new(HeapAllocator::new()),
        ));
        let first = segment.acquire(false).expect("ok").expect("第 0 代");
        let second = segment.acquire(false).expect("ok").expect("第 1 代");
        segment.release(first);

        let releaser = {
            let segment = segment.clone();
            thread::spawn(move || segment.release(second))
        };
        let _ = segment.evaluate_shrink();
        releaser.join().expect("线程不应 panic");

        let stats = segment.stats();
        assert_eq!(stats.outstanding, 0);
        assert!(stats.live_generations <= 2);
        assert!(stats.free_buffers <= 2);
    });
}
