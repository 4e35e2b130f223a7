use super::orchestrator::Query;
use super::response::Response;
use crate::cache::Status;
use crate::equality::Structural;
use crate::error::Result;
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;

/// Surface shared by [`Query`] and [`crate::store::Store`], usable as a trait object
pub trait StoreHandle<A, P>: Send + Sync {
    fn key(&self) -> &str;

    /// # Errors
    ///
    /// Returns an error if the handle was destroyed or `param` has no cache key
    fn fetch(&self, param: P) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the handle was destroyed or does not support reloading
    fn reload(&self) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the handle was destroyed
    fn reset(&self) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the handle was destroyed
    fn mutate(&self, mutate: &dyn Fn(&A) -> A) -> Result<bool>;

    /// # Errors
    ///
    /// Returns an error if the handle does not support refetch control
    fn disable_refetch(&self, disabled: bool) -> Result<()>;

    fn destroy(&self);

    fn is_destroyed(&self) -> bool;

    /// # Errors
    ///
    /// Returns an error if the handle was destroyed
    fn status(&self) -> Result<BoxStream<'static, Status<A>>>;

    /// # Errors
    ///
    /// Returns an error if the handle was destroyed
    fn select_data(&self) -> Result<BoxStream<'static, Arc<A>>>;

    fn response(&self) -> BoxStream<'static, Response<A, P>>;

    fn init_data(&self) -> Arc<A>;
}

impl<A, P> StoreHandle<A, P> for Query<A, P>
where
    A: Structural + Send + Sync + 'static,
    P: Clone + Serialize + Send + Sync + 'static,
{
    fn key(&self) -> &str {
        Self::key(self)
    }

    fn fetch(&self, param: P) -> Result<()> {
        Self::fetch(self, param)
    }

    fn reload(&self) -> Result<()> {
        Self::reload(self)
    }

    fn reset(&self) -> Result<()> {
        Self::reset(self)
    }

    fn mutate(&self, mutate: &dyn Fn(&A) -> A) -> Result<bool> {
        Self::mutate(self, mutate)
    }

    fn disable_refetch(&self, disabled: bool) -> Result<()> {
        Self::disable_refetch(self, disabled);
        Ok(())
    }

    fn destroy(&self) {
        Self::destroy(self);
    }

    fn is_destroyed(&self) -> bool {
        Self::is_destroyed(self)
    }

    fn status(&self) -> Result<BoxStream<'static, Status<A>>> {
        Self::status(self)
    }

    fn select_data(&self) -> Result<BoxStream<'static, Arc<A>>> {
        Self::select_data(self)
    }

    fn response(&self) -> BoxStream<'static, Response<A, P>> {
        Self::response(self)
    }

    fn init_data(&self) -> Arc<A> {
        Self::init_data(self)
    }
}
