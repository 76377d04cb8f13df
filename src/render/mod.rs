//! Response body renderers.
//!
//! A [`Renderer`] knows its content type and how to write itself into a
//! [`ResponseState`]. [`Context::render`] wires one up with a status code;
//! the [`string`]/[`html`]/[`json`] helpers cover the common cases.
//!
//! [`Context::render`]: crate::context::Context::render
//! [`string`]: crate::context::Context::string
//! [`html`]: crate::context::Context::html
//! [`json`]: crate::context::Context::json

use serde::Serialize;

use crate::error::Error;
use crate::response::ResponseState;

/// A value that can be written out as a response body.
pub trait Renderer {
    /// Content type set for the response, unless one is already present.
    fn content_type(&self) -> &'static str;

    /// Writes the body into the response, flushing the head as a side
    /// effect of the first write.
    fn render(self, res: &mut ResponseState) -> Result<(), Error>;
}

/// Plain text body.
pub struct Text(pub String);

impl Renderer for Text {
    fn content_type(&self) -> &'static str {
        "text/plain; charset=utf-8"
    }

    fn render(self, res: &mut ResponseState) -> Result<(), Error> {
        res.write_str(&self.0)?;
        Ok(())
    }
}

/// HTML body.
pub struct Html(pub String);

impl Renderer for Html {
    fn content_type(&self) -> &'static str {
        "text/html; charset=utf-8"
    }

    fn render(self, res: &mut ResponseState) -> Result<(), Error> {
        res.write_str(&self.0)?;
        Ok(())
    }
}

/// JSON body serialized from any [`Serialize`] value.
pub struct Json<T: Serialize>(pub T);

impl<T: Serialize> Renderer for Json<T> {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn render(self, res: &mut ResponseState) -> Result<(), Error> {
        let body = serde_json::to_vec(&self.0)?;
        res.write(&body)?;
        Ok(())
    }
}

/// Raw bytes with an explicit content type.
pub struct Raw {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Renderer for Raw {
    fn content_type(&self) -> &'static str {
        self.content_type
    }

    fn render(self, res: &mut ResponseState) -> Result<(), Error> {
        res.write(&self.body)?;
        Ok(())
    }
}

/// Escapes text for safe interpolation into HTML error pages.
pub(crate) fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use crate::response::{BufferSink, ResponseState};

    fn bound_state() -> ResponseState {
        let mut state = ResponseState::idle();
        state.reset(Box::new(BufferSink::new(true)));
        state
    }

    fn into_sink(mut state: ResponseState) -> BufferSink {
        let sink = state.take_sink().unwrap();
        *sink.into_any().downcast::<BufferSink>().unwrap()
    }

    #[test]
    fn json_serializes_value() {
        let mut state = bound_state();
        state.set_status(StatusCode::Ok);
        Json(serde_json::json!({"ok": true}))
            .render(&mut state)
            .unwrap();
        let sink = into_sink(state);
        assert_eq!(sink.body(), br#"{"ok":true}"#);
    }

    #[test]
    fn escape_html_covers_specials() {
        assert_eq!(
            escape_html(r#"<a href="x">&'"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
        assert_eq!(escape_html("plain"), "plain");
    }
}
