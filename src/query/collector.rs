// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reductions for [`RemoteQuery::collect`](super::RemoteQuery::collect).

use std::marker::PhantomData;

/// A mutable reduction: create a container, fold elements in, finish.
pub trait Collector<T> {
    type Container;
    type Output;

    fn supply(&self) -> Self::Container;

    fn accumulate(&self, container: &mut Self::Container, item: T);

    fn finish(&self, container: Self::Container) -> Self::Output;
}

/// Collector assembled from three closures.
pub struct FnCollector<T, C, R, S, A, F> {
    supply: S,
    accumulate: A,
    finish: F,
    _types: PhantomData<fn(T) -> (C, R)>,
}

/// Build a collector from supply, accumulate and finish steps.
pub fn collector<T, C, R, S, A, F>(supply: S, accumulate: A, finish: F) -> FnCollector<T, C, R, S, A, F>
where
    S: Fn() -> C,
    A: Fn(&mut C, T),
    F: Fn(C) -> R,
{
    FnCollector {
        supply,
        accumulate,
        finish,
        _types: PhantomData,
    }
}

impl<T, C, R, S, A, F> Collector<T> for FnCollector<T, C, R, S, A, F>
where
    S: Fn() -> C,
    A: Fn(&mut C, T),
    F: Fn(C) -> R,
{
    type Container = C;
    type Output = R;

    fn supply(&self) -> C {
        (self.supply)()
    }

    fn accumulate(&self, container: &mut C, item: T) {
        (self.accumulate)(container, item)
    }

    fn finish(&self, container: C) -> R {
        (self.finish)(container)
    }
}

/// Collects into a `Vec` in delivery order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToVec;

impl<T> Collector<T> for ToVec {
    type Container = Vec<T>;
    type Output = Vec<T>;

    fn supply(&self) -> Vec<T> {
        Vec::new()
    }

    fn accumulate(&self, container: &mut Vec<T>, item: T) {
        container.push(item);
    }

    fn finish(&self, container: Vec<T>) -> Vec<T> {
        container
    }
}

/// Counts elements.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counting;

impl<T> Collector<T> for Counting {
    type Container = u64;
    type Output = u64;

    fn supply(&self) -> u64 {
        0
    }

    fn accumulate(&self, container: &mut u64, _item: T) {
        *container += 1;
    }

    fn finish(&self, container: u64) -> u64 {
        container
    }
}
