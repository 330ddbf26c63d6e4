#![cfg(any(loom, spark_loom))]

use loom::{
    model,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};
use spark_coroutine::{ResumeGate, SuspensionState};

#[test]
fn racing_resumers_admit_exactly_one_winner() {
    //
    // 教案级说明：两个事件源（例如定时器线程与外部回调线程）同时尝试完成同一挂起点。
    // - **Why**：若 CAS 语义有误，两个结果都会被写入，续体被调用两次。
    // - **How**：Loom 穷举两条线程的 `try_begin`/`finish` 交错，统计胜者数量。
    // - **What**：胜者恰好一个，结束后状态为 `Resumed` 且不再接受新的 `try_begin`。
    model(|| {
        let gate = Arc::new(ResumeGate::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if gate.try_begin() {
                        winners.fetch_add(1, Ordering::SeqCst);
                        gate.finish();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("恢复线程不应 panic");
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1, "只允许一个恢复者胜出");
        assert_eq!(gate.state(), SuspensionState::Resumed);
        assert!(!gate.try_begin(), "终态不可再次进入 Completing");
    });
}

#[test]
fn observer_never_sees_resumed_before_completing() {
    //
    // 教案级说明：挂起方在轮询中读取状态，完成方推进状态。
    // - **What**：观察者看到的状态序列单调：Pending -> Completing -> Resumed，不会回退。
    model(|| {
        let gate = Arc::new(ResumeGate::new());
        let completer = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                assert!(gate.try_begin());
                gate.finish();
            })
        };
        let first = gate.state();
        let second = gate.state();
        let rank = |state: SuspensionState| match state {
            SuspensionState::Pending => 0,
            SuspensionState::Completing => 1,
            SuspensionState::Resumed => 2,
        };
        assert!(rank(first) <= rank(second), "状态不可回退");
        completer.join().expect("完成线程不应 panic");
        assert_eq!(gate.state(), SuspensionState::Resumed);
    });
}
