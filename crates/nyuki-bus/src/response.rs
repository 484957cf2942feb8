use nyuki_protocol::ResponseBody;
use serde_json::Value;

/// Reply to a bus request.
///
/// The body is parsed once on construction; `json()` is `None` when it is
/// not valid JSON and the raw text stays available through `text()`.
#[derive(Debug, Clone, PartialEq)]
pub struct BusResponse {
    status: u16,
    json: Option<Value>,
    text: String,
}

impl BusResponse {
    pub fn new(status: u16, text: impl Into<String>) -> Self {
        let text = text.into();
        let json = serde_json::from_str(&text).ok();
        Self { status, json, text }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn json(&self) -> Option<&Value> {
        self.json.as_ref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<ResponseBody> for BusResponse {
    fn from(body: ResponseBody) -> Self {
        Self::new(body.status, body.body)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::BusResponse;

    #[test]
    fn json_body_is_parsed() {
        let response = BusResponse::new(200, r#"{"response": "text"}"#);
        assert_eq!(response.json(), Some(&json!({"response": "text"})));
        assert!(response.is_success());
    }

    #[test]
    fn non_json_body_falls_back_to_text() {
        let response = BusResponse::new(200, "something");
        assert_eq!(response.json(), None);
        assert_eq!(response.text(), "something");
    }
}
