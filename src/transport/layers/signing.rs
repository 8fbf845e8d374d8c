use std::{future::Future, pin::Pin, sync::Arc};

use tower::{Layer, Service};

use crate::{Message, signing::Signer};

/// Tower `Service` wrapper that signs the wire copy of every message.
#[derive(Clone)]
pub struct SigningService<T> {
    inner: T,
    signer: Arc<dyn Signer>,
}

impl<T> Service<Message> for SigningService<T>
where
    T: Service<Message> + Clone + Send + 'static,
    T::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, mut req: Message) -> Self::Future {
        let mut inner = self.inner.clone();
        let signed = self.signer.sign(&mut req);

        Box::pin(async move {
            signed.map_err(Box::new)?;
            inner.call(req).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies `SigningService` to a service stack.
#[derive(Clone)]
pub struct SigningLayer {
    signer: Arc<dyn Signer>,
}

impl SigningLayer {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }
}

impl<S> Layer<S> for SigningLayer {
    type Service = SigningService<S>;

    fn layer(&self, service: S) -> Self::Service {
        SigningService {
            inner: service,
            signer: self.signer.clone(),
        }
    }
}
