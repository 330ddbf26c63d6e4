//! 协程上下文：不可变、可组合、按元素类型检索的键值集合。
//!
//! # 模块定位（Why）
//! - 协程在每个挂起点都可能换到另一条线程继续执行，调度策略（[`Dispatcher`](crate::Dispatcher)）、
//!   定时器、卸载线程策略等“环境”必须随协程一起流动，而不是依赖全局单例；
//! - 上下文创建后只读，因此可以在线程之间零拷贝共享。
//!
//! # 提供能力（How）
//! - [`Element`]：可放入上下文的元素标记 Trait，以 `TypeId` 作为键；
//! - [`Context::with`]/[`Context::merge`]：并集组合，同类元素右侧覆盖左侧；
//! - [`Context::current`]：读取当前线程上正在被轮询的协程的上下文。
//!
//! # 使用契约（What）
//! - 同一类型的元素在一个上下文中至多出现一次；
//! - `Context::current` 只用于读取信息（定时器、卸载策略、名称），调度路由始终由任务自身持有的上下文决定。

use std::{
    any::{Any, TypeId},
    borrow::Cow,
    cell::RefCell,
    fmt,
    ops::Add,
    sync::Arc,
};

/// 可放入 [`Context`] 的元素。
///
/// 元素以其具体类型作为键，因此同一类型在上下文中只会保留一份。
pub trait Element: Any + Send + Sync + fmt::Debug {}

#[derive(Clone)]
struct Entry {
    key: TypeId,
    value: Arc<dyn ElementObject>,
}

/// 对象安全的内部视图：同时提供 `Any` 下转型与 `Debug` 输出。
trait ElementObject: Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

impl<E: Element> ElementObject for E {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 协程上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：对应“续体持有的目标上下文”；调度器作为上下文元素，可在每次恢复时被检索到。
/// - **逻辑 (How)**：内部为 `Arc<[Entry]>`，元素数量很少（通常 0~4 个），线性查找优于哈希表；
///   每次组合都会生成新的切片，旧上下文保持不变。
/// - **契约 (What)**：
///   - `Clone` 只增加引用计数；
///   - `with`/`merge` 不修改接收者；
///   - `get::<E>()` 返回最后一次放入的 `E`。
#[derive(Clone, Default)]
pub struct Context {
    entries: Option<Arc<[Entry]>>,
}

impl Context {
    /// 空上下文：不含调度器，续体在触发事件的线程上就地恢复。
    pub const fn empty() -> Self {
        Self { entries: None }
    }

    /// 以单个元素构造上下文。
    pub fn of<E: Element>(element: E) -> Self {
        Self::empty().with(element)
    }

    /// 返回加入（或替换）`element` 后的新上下文。
    pub fn with<E: Element>(&self, element: E) -> Self {
        let entry = Entry {
            key: TypeId::of::<E>(),
            value: Arc::new(element),
        };
        self.union(std::slice::from_ref(&entry))
    }

    /// 返回移除 `E` 后的新上下文；不含 `E` 时返回自身的克隆。
    pub fn without<E: Element>(&self) -> Self {
        let key = TypeId::of::<E>();
        if !self.contains::<E>() {
            return self.clone();
        }
        let remaining: Vec<Entry> = self
            .slice()
            .iter()
            .filter(|entry| entry.key != key)
            .cloned()
            .collect();
        Self::from_entries(remaining)
    }

    /// 右偏并集：`other` 中的元素覆盖 `self` 中的同类元素。
    pub fn merge(&self, other: &Context) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        self.union(other.slice())
    }

    /// 按类型检索元素。
    pub fn get<E: Element>(&self) -> Option<&E> {
        let key = TypeId::of::<E>();
        self.slice()
            .iter()
            .find(|entry| entry.key == key)
            .and_then(|entry| entry.value.as_any().downcast_ref::<E>())
    }

    /// 是否包含类型为 `E` 的元素。
    pub fn contains<E: Element>(&self) -> bool {
        let key = TypeId::of::<E>();
        self.slice().iter().any(|entry| entry.key == key)
    }

    pub fn len(&self) -> usize {
        self.slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slice().is_empty()
    }

    /// 上下文中的调度器（若有）。
    pub fn dispatcher(&self) -> Option<&crate::Dispatcher> {
        self.get::<crate::Dispatcher>()
    }

    /// 上下文中的协程名称（若有）。
    pub fn name(&self) -> Option<&str> {
        self.get::<CoroutineName>().map(CoroutineName::as_str)
    }

    /// 当前线程正在轮询的协程上下文；不在协程内时返回空上下文。
    pub fn current() -> Context {
        CURRENT.with(|current| current.borrow().clone().unwrap_or_default())
    }

    /// 在 `f` 执行期间把 `self` 设为当前上下文，返回后恢复原值（支持嵌套）。
    pub(crate) fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = CURRENT.with(|current| current.replace(Some(self.clone())));
        let _restore = RestoreCurrent(previous);
        f()
    }

    fn slice(&self) -> &[Entry] {
        self.entries.as_deref().unwrap_or(&[])
    }

    fn union(&self, incoming: &[Entry]) -> Self {
        let mut merged: Vec<Entry> = self
            .slice()
            .iter()
            .filter(|existing| incoming.iter().all(|entry| entry.key != existing.key))
            .cloned()
            .collect();
        merged.extend(incoming.iter().cloned());
        Self::from_entries(merged)
    }

    fn from_entries(entries: Vec<Entry>) -> Self {
        if entries.is_empty() {
            Self::empty()
        } else {
            Self {
                entries: Some(entries.into()),
            }
        }
    }
}

impl Add for Context {
    type Output = Context;

    fn add(self, rhs: Context) -> Context {
        self.merge(&rhs)
    }
}

impl<E: Element> Add<E> for Context {
    type Output = Context;

    fn add(self, rhs: E) -> Context {
        self.with(rhs)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.slice().iter().map(|entry| &entry.value))
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

struct RestoreCurrent(Option<Context>);

impl Drop for RestoreCurrent {
    fn drop(&mut self) {
        let previous = self.0.take();
        CURRENT.with(|current| {
            *current.borrow_mut() = previous;
        });
    }
}

/// 协程名称元素，用于日志 span 与失败上报。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CoroutineName(Cow<'static, str>);

impl CoroutineName {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Element for CoroutineName {}

impl fmt::Display for CoroutineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Tag(u8);
    impl Element for Tag {}

    #[test]
    fn with_replaces_same_kind() {
        let ctx = Context::of(Tag(1)).with(CoroutineName::new("a")).with(Tag(2));
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.get::<Tag>(), Some(&Tag(2)));
        assert_eq!(ctx.name(), Some("a"));
    }

    #[test]
    fn with_leaves_receiver_untouched() {
        let base = Context::of(Tag(1));
        let _derived = base.with(Tag(9));
        assert_eq!(base.get::<Tag>(), Some(&Tag(1)));
    }

    #[test]
    fn without_removes_only_requested_kind() {
        let ctx = Context::of(Tag(1)) + CoroutineName::new("n");
        let stripped = ctx.without::<Tag>();
        assert!(!stripped.contains::<Tag>());
        assert_eq!(stripped.name(), Some("n"));
        assert!(Context::empty().without::<Tag>().is_empty());
    }

    #[test]
    fn current_is_scoped_and_nested() {
        assert!(Context::current().is_empty());
        let outer = Context::of(CoroutineName::new("outer"));
        let inner = Context::of(CoroutineName::new("inner"));
        outer.enter(|| {
            assert_eq!(Context::current().name(), Some("outer"));
            inner.enter(|| assert_eq!(Context::current().name(), Some("inner")));
            assert_eq!(Context::current().name(), Some("outer"));
        });
        assert!(Context::current().is_empty());
    }
}
