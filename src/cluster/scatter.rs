//! Concurrent fan-out with aggregated errors.
//!
//! All operations are polled concurrently and the call returns only after
//! every one of them has finished. A failing index never cancels the others.

use crate::core::{MultiError, Result};
use futures::future::join_all;
use std::future::Future;

/// Runs `f(0)..f(n)` concurrently and collects every failure.
pub async fn scatter<F, Fut>(n: usize, f: F) -> std::result::Result<(), MultiError>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    gather(join_all((0..n).map(f)).await)
}

/// Like [`scatter`], handing each operation exclusive access to its own slot.
pub async fn scatter_slots<'a, T, F, Fut>(
    slots: &'a mut [T],
    f: F,
) -> std::result::Result<(), MultiError>
where
    F: Fn(usize, &'a mut T) -> Fut,
    Fut: Future<Output = Result<()>> + 'a,
{
    gather(join_all(slots.iter_mut().enumerate().map(|(idx, slot)| f(idx, slot))).await)
}

fn gather(results: Vec<Result<()>>) -> std::result::Result<(), MultiError> {
    let errors: MultiError = results.into_iter().filter_map(|r| r.err()).collect();
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
