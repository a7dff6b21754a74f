use std::time::Duration;

use hearth_core::AnyError;
use monoio::time::timeout;
use service_async::{AsyncMakeService, MakeService, Service};

/// Bounds how long the wrapped service may spend on one call. With no
/// deadline configured it is a transparent pass-through.
#[derive(Clone)]
pub struct TimeoutService<T> {
    deadline: Option<Duration>,
    inner: T,
}

impl<T> TimeoutService<T> {
    pub fn new(deadline: Option<Duration>, inner: T) -> Self {
        Self { deadline, inner }
    }
}

impl<R, T> Service<R> for TimeoutService<T>
where
    T: Service<R>,
    T::Error: Into<AnyError>,
{
    type Response = T::Response;
    type Error = AnyError;

    async fn call(&self, req: R) -> Result<Self::Response, Self::Error> {
        match self.deadline {
            None => self.inner.call(req).await.map_err(Into::into),
            Some(deadline) => match timeout(deadline, self.inner.call(req)).await {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(err)) => Err(err.into()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

impl<F> MakeService for TimeoutService<F>
where
    F: MakeService,
{
    type Service = TimeoutService<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(TimeoutService {
            deadline: self.deadline,
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<F> AsyncMakeService for TimeoutService<F>
where
    F: AsyncMakeService,
{
    type Service = TimeoutService<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(TimeoutService {
            deadline: self.deadline,
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}
