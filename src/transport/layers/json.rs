use std::{future::Future, pin::Pin};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::{Layer, Service};

use crate::{
    Message,
    message::Tags,
    processor::{Context, InboundHook, MessageQueue, Step},
};

/// Install JSON formatting on a message queue.
///
/// Outbound messages are encoded by a [`JsonLayer`], inbound ones decoded by
/// a [`JsonDecoding`] hook.
pub fn json_formatting<S>(mq: MessageQueue<S>) -> MessageQueue<JsonService<S>> {
    mq.layer(JsonLayer).with_inbound_hook(JsonDecoding)
}

#[derive(Serialize)]
struct Encoding<'a> {
    id: &'a str,
    payload: &'a Value,
    tags: &'a Tags,
}

#[derive(Deserialize)]
struct Decoding {
    id: String,
    payload: Value,
    #[serde(default)]
    tags: Tags,
}

/// Tower `Service` wrapper that serializes messages to JSON.
///
/// The wire copy's payload becomes the JSON text of `{id, payload, tags}`
/// and its tags are cleared, so transports only ever carry a string.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T> Service<Message> for JsonService<T>
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

    fn call(&mut self, req: Message) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let text = serde_json::to_string(&Encoding {
                id: req.id(),
                payload: &req.payload,
                tags: &req.tags,
            })
            .map_err(Box::new)?;
            let encoded = Message::with_id(req.id(), req.to(), Value::String(text));

            inner.call(encoded).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies `JsonService` to a service stack.
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}

/// Inbound hook restoring messages encoded by [`JsonService`].
///
/// Messages that are not valid encodings are dropped.
pub struct JsonDecoding;

#[async_trait]
impl InboundHook for JsonDecoding {
    async fn before_handle(&self, _ctx: &Context<'_>, message: &mut Message) -> Step {
        let Value::String(text) = &message.payload else {
            return Step::Abort("payload is not JSON text".to_owned());
        };
        let decoded: Decoding = match serde_json::from_str(text) {
            Ok(decoded) => decoded,
            Err(err) => return Step::Abort(format!("undecodable payload: {err}")),
        };

        let mut restored = Message::with_id(decoded.id, message.to(), decoded.payload);
        restored.tags = decoded.tags;
        restored.private = std::mem::take(&mut message.private);
        *message = restored;
        Step::Proceed
    }
}
