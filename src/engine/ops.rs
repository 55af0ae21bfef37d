//! Stateless operators.
//!
//! Each function returns a [`ProcessorSupplier`] that decodes the incoming
//! value as `T` and applies a closure to it. None of them touch a store.

use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;
use std::sync::Arc;

use super::processor::{Processor, ProcessorContext, ProcessorSupplier, StreamRecord, supplier};
use crate::error::Result;

struct Filter<T, F> {
    predicate: Arc<F>,
    _value: PhantomData<fn() -> T>,
}

impl<T, F> Processor for Filter<T, F>
where
    T: DeserializeOwned,
    F: Fn(&str, &T) -> bool + Send + Sync,
{
    fn process(&mut self, record: &StreamRecord, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        let value: T = record.decode()?;
        if (self.predicate)(&record.key, &value) {
            ctx.forward_record(record);
        }
        Ok(())
    }
}

/// Forwards records for which `predicate` holds and drops the rest.
pub fn filter<T, F>(predicate: F) -> ProcessorSupplier
where
    T: DeserializeOwned + 'static,
    F: Fn(&str, &T) -> bool + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    supplier(move || Filter::<T, F> {
        predicate: predicate.clone(),
        _value: PhantomData,
    })
}

struct MapValues<T, U, F> {
    mapper: Arc<F>,
    _value: PhantomData<fn(T) -> U>,
}

impl<T, U, F> Processor for MapValues<T, U, F>
where
    T: DeserializeOwned,
    U: Serialize,
    F: Fn(&str, T) -> U + Send + Sync,
{
    fn process(&mut self, record: &StreamRecord, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        let mapped = (self.mapper)(&record.key, record.decode()?);
        ctx.forward(record.key.clone(), &mapped, record.timestamp)
    }
}

/// Replaces each value, keeping the key.
pub fn map_values<T, U, F>(mapper: F) -> ProcessorSupplier
where
    T: DeserializeOwned + 'static,
    U: Serialize + 'static,
    F: Fn(&str, T) -> U + Send + Sync + 'static,
{
    let mapper = Arc::new(mapper);
    supplier(move || MapValues::<T, U, F> {
        mapper: mapper.clone(),
        _value: PhantomData,
    })
}

struct SelectKey<T, F> {
    selector: Arc<F>,
    _value: PhantomData<fn() -> T>,
}

impl<T, F> Processor for SelectKey<T, F>
where
    T: DeserializeOwned,
    F: Fn(&str, &T) -> String + Send + Sync,
{
    fn process(&mut self, record: &StreamRecord, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        let value: T = record.decode()?;
        let key = (self.selector)(&record.key, &value);
        ctx.forward(key, &record.value, record.timestamp)
    }
}

/// Re-keys each record. Must be registered with [`super::Keying::Rekeys`]
/// so the topology knows downstream records are no longer co-partitioned.
pub fn select_key<T, F>(selector: F) -> ProcessorSupplier
where
    T: DeserializeOwned + 'static,
    F: Fn(&str, &T) -> String + Send + Sync + 'static,
{
    let selector = Arc::new(selector);
    supplier(move || SelectKey::<T, F> {
        selector: selector.clone(),
        _value: PhantomData,
    })
}

struct Peek<T, F> {
    action: Arc<F>,
    _value: PhantomData<fn() -> T>,
}

impl<T, F> Processor for Peek<T, F>
where
    T: DeserializeOwned,
    F: Fn(&str, &T) + Send + Sync,
{
    fn process(&mut self, record: &StreamRecord, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        let value: T = record.decode()?;
        (self.action)(&record.key, &value);
        ctx.forward_record(record);
        Ok(())
    }
}

/// Runs `action` on each record and passes it on unchanged.
pub fn peek<T, F>(action: F) -> ProcessorSupplier
where
    T: DeserializeOwned + 'static,
    F: Fn(&str, &T) + Send + Sync + 'static,
{
    let action = Arc::new(action);
    supplier(move || Peek::<T, F> {
        action: action.clone(),
        _value: PhantomData,
    })
}

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Routes each record to exactly one child: the first branch whose predicate
/// matches, otherwise the default child if there is one.
pub struct BranchBuilder<T> {
    branches: Vec<(String, Predicate<T>)>,
    default: Option<String>,
}

impl<T: DeserializeOwned + 'static> BranchBuilder<T> {
    pub fn new() -> Self {
        Self {
            branches: Vec::new(),
            default: None,
        }
    }

    pub fn branch<F>(mut self, child: &str, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.branches.push((child.to_string(), Arc::new(predicate)));
        self
    }

    pub fn default_branch(mut self, child: &str) -> Self {
        self.default = Some(child.to_string());
        self
    }

    pub fn build(self) -> ProcessorSupplier {
        let branches = Arc::new(self.branches);
        let default = self.default;
        supplier(move || Branch::<T> {
            branches: branches.clone(),
            default: default.clone(),
        })
    }
}

impl<T: DeserializeOwned + 'static> Default for BranchBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Branch<T> {
    branches: Arc<Vec<(String, Predicate<T>)>>,
    default: Option<String>,
}

impl<T: DeserializeOwned> Processor for Branch<T> {
    fn process(&mut self, record: &StreamRecord, ctx: &mut ProcessorContext<'_>) -> Result<()> {
        let value: T = record.decode()?;
        let target = self
            .branches
            .iter()
            .find(|(_, predicate)| predicate(&value))
            .map(|(child, _)| child.as_str())
            .or(self.default.as_deref());

        if let Some(child) = target {
            ctx.forward_to(child, record.key.clone(), &record.value, record.timestamp)?;
        }
        Ok(())
    }
}
