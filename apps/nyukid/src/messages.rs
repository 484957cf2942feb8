//! In-memory message board served under `/message`.

use std::collections::BTreeMap;
use std::future::ready;
use std::sync::Arc;

use nyuki_api::{Capability, ExposerError, HandlerResult, Request, Response};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MessageBoard {
    messages: Arc<RwLock<BTreeMap<String, String>>>,
}

impl Default for MessageBoard {
    fn default() -> Self {
        let messages = BTreeMap::from([
            ("1".to_owned(), "message 1".to_owned()),
            ("2".to_owned(), "message 2".to_owned()),
        ]);
        Self {
            messages: Arc::new(RwLock::new(messages)),
        }
    }
}

impl MessageBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `/message` (list, add) and `/message/{mid}` (read, edit).
    pub fn capabilities(&self) -> Result<Vec<Capability>, ExposerError> {
        let (list, add, read, edit) = (self.clone(), self.clone(), self.clone(), self.clone());
        Ok(vec![
            Capability::builder("messages", "/message")
                .get(move |_: Request| ready(list.list()))
                .post(move |request: Request| ready(add.add(request)))
                .build()?,
            Capability::builder("message", "/message/{mid:int}")
                .get(move |request: Request| ready(read.read(request)))
                .patch(move |request: Request| ready(edit.edit(request)))
                .build()?,
        ])
    }

    fn list(&self) -> HandlerResult {
        Ok(Some(Response::new(&*self.messages.read())))
    }

    fn add(&self, request: Request) -> HandlerResult {
        let Some(Value::Object(entries)) = request.body else {
            return Ok(Some(bad_request("messages must be a JSON object")));
        };
        let mut messages = self.messages.write();
        for (id, text) in entries {
            debug!(%id, "message stored");
            messages.insert(id, text_of(text));
        }
        Ok(Some(Response::new(&*messages)))
    }

    fn read(&self, request: Request) -> HandlerResult {
        let messages = self.messages.read();
        match request.param("mid").and_then(|mid| messages.get(mid)) {
            Some(text) => Ok(Some(Response::new(json!({ "message": text })))),
            None => Ok(Some(missing())),
        }
    }

    fn edit(&self, request: Request) -> HandlerResult {
        let text = request
            .body
            .as_ref()
            .and_then(|body| body.get("message"))
            .cloned();
        let Some(text) = text else {
            return Ok(Some(bad_request("missing message")));
        };

        let mut messages = self.messages.write();
        let Some(entry) = request.param("mid").and_then(|mid| messages.get_mut(mid)) else {
            return Ok(Some(missing()));
        };
        *entry = text_of(text);
        Ok(Some(Response::new(json!({ "message": entry }))))
    }
}

fn text_of(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn missing() -> Response {
    Response::with_status(404, json!({ "message": "message does not exists" }))
}

fn bad_request(message: &str) -> Response {
    Response::with_status(400, json!({ "message": message }))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use nyuki_api::Exposer;
    use nyuki_protocol::Method;
    use serde_json::{Value, json};

    use super::MessageBoard;

    fn exposer() -> Result<Exposer> {
        let exposer = Exposer::new();
        exposer.mount(MessageBoard::new().capabilities()?)?;
        Ok(exposer)
    }

    fn json(body: &str) -> Result<Value> {
        Ok(serde_json::from_str(body)?)
    }

    #[tokio::test]
    async fn posted_messages_are_listed_with_the_rest() -> Result<()> {
        let exposer = exposer()?;
        let posted = exposer
            .dispatch(Method::Post, "/message", Some(&json!({"3": "hi"})))
            .await?;
        assert_eq!(posted.status, 200);

        let listed = exposer.dispatch(Method::Get, "/message", None).await?;
        assert_eq!(
            json(&listed.body)?,
            json!({"1": "message 1", "2": "message 2", "3": "hi"})
        );
        Ok(())
    }

    #[tokio::test]
    async fn single_messages_are_read_and_edited() -> Result<()> {
        let exposer = exposer()?;
        let read = exposer.dispatch(Method::Get, "/message/2", None).await?;
        assert_eq!(json(&read.body)?, json!({"message": "message 2"}));

        let edited = exposer
            .dispatch(Method::Patch, "/message/2", Some(&json!({"message": "edited"})))
            .await?;
        assert_eq!(edited.status, 200);
        let read = exposer.dispatch(Method::Get, "/message/2", None).await?;
        assert_eq!(json(&read.body)?, json!({"message": "edited"}));

        let rejected = exposer
            .dispatch(Method::Patch, "/message/2", Some(&json!({"text": "nope"})))
            .await?;
        assert_eq!(rejected.status, 400);
        assert_eq!(json(&rejected.body)?, json!({"message": "missing message"}));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_not_found() -> Result<()> {
        let exposer = exposer()?;
        let unknown = exposer.dispatch(Method::Get, "/message/42", None).await?;
        assert_eq!(unknown.status, 404);
        assert_eq!(
            json(&unknown.body)?,
            json!({"message": "message does not exists"})
        );

        let malformed = exposer.dispatch(Method::Get, "/message/abc", None).await?;
        assert_eq!(malformed.status, 404);
        assert_eq!(json(&malformed.body)?, json!({"error": "not found"}));
        Ok(())
    }
}
