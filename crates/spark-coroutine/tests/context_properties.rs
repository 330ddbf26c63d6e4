//! `Context` 组合代数的性质验证
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：上下文是调度器、定时器与卸载策略随协程流动的唯一载体；
//!   若 `with`/`without`/`merge` 在某个组合下丢失或错放元素，协程会在错误的线程上恢复。
//! - **设计手法 (How)**：以 `BTreeMap<Kind, u8>` 作为影子模型，对随机操作序列同时驱动模型与真实 `Context`，
//!   每一步比较两者的可观测结果。
//! - **合同 (What)**：
//!   - 每种元素至多出现一次，`len()` 等于模型键数；
//!   - `get` 总是返回最后一次放入的值；
//!   - `merge` 为右偏并集，且不修改任一操作数。

use std::collections::BTreeMap;

use proptest::prelude::*;
use spark_coroutine::{Context, Element};

#[derive(Debug, PartialEq)]
struct Alpha(u8);
impl Element for Alpha {}

#[derive(Debug, PartialEq)]
struct Beta(u8);
impl Element for Beta {}

#[derive(Debug, PartialEq)]
struct Gamma(u8);
impl Element for Gamma {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Kind {
    Alpha,
    Beta,
    Gamma,
}

#[derive(Clone, Debug)]
enum Op {
    With(Kind, u8),
    Without(Kind),
}

fn kind() -> impl Strategy<Value = Kind> {
    prop_oneof![Just(Kind::Alpha), Just(Kind::Beta), Just(Kind::Gamma)]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (kind(), any::<u8>()).prop_map(|(kind, value)| Op::With(kind, value)),
        1 => kind().prop_map(Op::Without),
    ]
}

fn apply(context: &Context, model: &mut BTreeMap<Kind, u8>, op: &Op) -> Context {
    match *op {
        Op::With(kind, value) => {
            model.insert(kind, value);
            match kind {
                Kind::Alpha => context.with(Alpha(value)),
                Kind::Beta => context.with(Beta(value)),
                Kind::Gamma => context.with(Gamma(value)),
            }
        }
        Op::Without(kind) => {
            model.remove(&kind);
            match kind {
                Kind::Alpha => context.without::<Alpha>(),
                Kind::Beta => context.without::<Beta>(),
                Kind::Gamma => context.without::<Gamma>(),
            }
        }
    }
}

fn build(ops: &[Op]) -> (Context, BTreeMap<Kind, u8>) {
    let mut model = BTreeMap::new();
    let mut context = Context::empty();
    for op in ops {
        context = apply(&context, &mut model, op);
    }
    (context, model)
}

fn observe(context: &Context) -> BTreeMap<Kind, u8> {
    let mut seen = BTreeMap::new();
    if let Some(Alpha(value)) = context.get::<Alpha>() {
        seen.insert(Kind::Alpha, *value);
    }
    if let Some(Beta(value)) = context.get::<Beta>() {
        seen.insert(Kind::Beta, *value);
    }
    if let Some(Gamma(value)) = context.get::<Gamma>() {
        seen.insert(Kind::Gamma, *value);
    }
    seen
}

proptest! {
    #[test]
    fn prop_context_tracks_model(ops in prop::collection::vec(op(), 0..24)) {
        let (context, model) = build(&ops);
        prop_assert_eq!(context.len(), model.len());
        prop_assert_eq!(context.is_empty(), model.is_empty());
        prop_assert_eq!(observe(&context), model);
    }

    #[test]
    fn prop_merge_is_right_biased_union(
        left_ops in prop::collection::vec(op(), 0..12),
        right_ops in prop::collection::vec(op(), 0..12),
    ) {
        let (left, left_model) = build(&left_ops);
        let (right, right_model) = build(&right_ops);
        let merged = left.merge(&right);

        let mut expected = left_model.clone();
        expected.extend(right_model.iter().map(|(kind, value)| (*kind, *value)));
        prop_assert_eq!(observe(&merged), expected);
        prop_assert_eq!(observe(&(left.clone() + right.clone())), observe(&merged));

        prop_assert_eq!(observe(&left), left_model);
        prop_assert_eq!(observe(&right), right_model);
    }

    #[test]
    fn prop_merge_with_empty_is_identity(ops in prop::collection::vec(op(), 0..12)) {
        let (context, model) = build(&ops);
        prop_assert_eq!(observe(&context.merge(&Context::empty())), model.clone());
        prop_assert_eq!(observe(&Context::empty().merge(&context)), model);
    }
}
