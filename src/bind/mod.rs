//! Declarative binding of query strings, form bodies, and JSON bodies onto
//! plain structs.
//!
//! JSON goes through serde. Key/value sources (query strings,
//! `application/x-www-form-urlencoded` bodies) bind through a [`Schema`]: a
//! list of field setters a type declares once via the [`Bind`] trait. The
//! schema is built on first use per type and memoized process-wide.
//!
//! Binding rules for key/value sources:
//! - scalar fields take the first occurrence of a key; repeats are ignored
//! - list fields accumulate every occurrence
//! - an empty value counts as present but leaves the field's default
//! - unknown keys are ignored
//! - `required` means the key must appear, even with an empty value

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::context::Context;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid value for field '{0}'")]
    InvalidValue(&'static str),
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// How repeated keys bind to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// First occurrence wins; later repeats are dropped.
    Scalar,
    /// Every occurrence is fed to the setter in order.
    List,
}

/// One bindable field: a key name, its repeat policy, and a setter.
pub struct Field<T> {
    name: &'static str,
    required: bool,
    kind: FieldKind,
    set: fn(&mut T, &str) -> Result<(), BindError>,
}

/// Ordered field list for a bindable type. Built once per type.
pub struct Schema<T> {
    fields: Vec<Field<T>>,
}

impl<T: Default> Schema<T> {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Declares an optional field.
    pub fn field(
        mut self,
        name: &'static str,
        kind: FieldKind,
        set: fn(&mut T, &str) -> Result<(), BindError>,
    ) -> Self {
        self.fields.push(Field {
            name,
            required: false,
            kind,
            set,
        });
        self
    }

    /// Declares a field whose key must appear in the source.
    pub fn required(
        mut self,
        name: &'static str,
        kind: FieldKind,
        set: fn(&mut T, &str) -> Result<(), BindError>,
    ) -> Self {
        self.fields.push(Field {
            name,
            required: true,
            kind,
            set,
        });
        self
    }

    /// Binds decoded key/value pairs into a fresh `T`.
    pub fn bind(&self, pairs: &[(String, String)]) -> Result<T, BindError> {
        let mut value = T::default();
        let mut seen = vec![false; self.fields.len()];

        for (key, raw) in pairs {
            let Some(i) = self.fields.iter().position(|f| f.name == key) else {
                continue;
            };
            let field = &self.fields[i];
            if field.kind == FieldKind::Scalar && seen[i] {
                continue;
            }
            seen[i] = true;
            if raw.is_empty() {
                continue;
            }
            (field.set)(&mut value, raw)?;
        }

        for (i, field) in self.fields.iter().enumerate() {
            if field.required && !seen[i] {
                return Err(BindError::MissingField(field.name));
            }
        }
        Ok(value)
    }
}

impl<T: Default> Default for Schema<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a raw value inside a setter, reporting the field on failure.
pub fn parse_value<V: FromStr>(raw: &str, field: &'static str) -> Result<V, BindError> {
    raw.parse().map_err(|_| BindError::InvalidValue(field))
}

/// Types bindable from key/value sources.
///
/// ```no_run
/// use trellis::bind::{Bind, FieldKind, Schema, parse_value};
///
/// #[derive(Default)]
/// struct Search {
///     q: String,
///     limit: u32,
///     tags: Vec<String>,
/// }
///
/// impl Bind for Search {
///     fn schema() -> Schema<Self> {
///         Schema::new()
///             .required("q", FieldKind::Scalar, |s: &mut Self, v| {
///                 s.q = v.to_string();
///                 Ok(())
///             })
///             .field("limit", FieldKind::Scalar, |s: &mut Self, v| {
///                 s.limit = parse_value(v, "limit")?;
///                 Ok(())
///             })
///             .field("tags", FieldKind::List, |s: &mut Self, v| {
///                 s.tags.push(v.to_string());
///                 Ok(())
///             })
///     }
/// }
/// ```
pub trait Bind: Default + Sized + 'static {
    fn schema() -> Schema<Self>;
}

static SCHEMAS: OnceLock<RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>> = OnceLock::new();

/// The memoized schema for `T`, built on first call.
fn schema_of<T: Bind>() -> Arc<Schema<T>> {
    let cache = SCHEMAS.get_or_init(|| RwLock::new(HashMap::new()));
    let id = TypeId::of::<T>();

    if let Some(schema) = cache
        .read()
        .get(&id)
        .and_then(|boxed| boxed.downcast_ref::<Arc<Schema<T>>>())
    {
        return schema.clone();
    }

    let schema = Arc::new(T::schema());
    let mut cache = cache.write();
    cache
        .entry(id)
        .or_insert_with(|| Box::new(schema) as Box<dyn Any + Send + Sync>)
        .downcast_ref::<Arc<Schema<T>>>()
        .cloned()
        // Cannot miss: the entry for this TypeId always holds Arc<Schema<T>>.
        .unwrap_or_else(|| Arc::new(T::schema()))
}

impl Context {
    /// Binds the request's query string.
    pub fn bind_query<T: Bind>(&self) -> Result<T, BindError> {
        let request = self.request();
        schema_of::<T>().bind(request.query_pairs())
    }

    /// Binds an `application/x-www-form-urlencoded` request body.
    pub fn bind_form<T: Bind>(&self) -> Result<T, BindError> {
        let request = self.request();
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(request.body())
            .map_err(|e| BindError::Payload(e.to_string()))?;
        schema_of::<T>().bind(&pairs)
    }

    /// Deserializes a JSON request body.
    pub fn bind_json<T: DeserializeOwned>(&self) -> Result<T, BindError> {
        let request = self.request();
        Ok(serde_json::from_slice(request.body())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;
    use crate::response::BufferSink;
    use serde::Deserialize;

    #[derive(Default, Debug, PartialEq)]
    struct Search {
        q: String,
        limit: u32,
        tags: Vec<String>,
    }

    impl Bind for Search {
        fn schema() -> Schema<Self> {
            Schema::new()
                .required("q", FieldKind::Scalar, |s: &mut Self, v| {
                    s.q = v.to_string();
                    Ok(())
                })
                .field("limit", FieldKind::Scalar, |s: &mut Self, v| {
                    s.limit = parse_value(v, "limit")?;
                    Ok(())
                })
                .field("tags", FieldKind::List, |s: &mut Self, v| {
                    s.tags.push(v.to_string());
                    Ok(())
                })
        }
    }

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn scalar_first_wins_list_accumulates() {
        let bound: Search = Search::schema()
            .bind(&pairs(&[
                ("q", "rust"),
                ("q", "ignored"),
                ("tags", "a"),
                ("tags", "b"),
            ]))
            .unwrap();
        assert_eq!(bound.q, "rust");
        assert_eq!(bound.tags, vec!["a", "b"]);
        assert_eq!(bound.limit, 0);
    }

    #[test]
    fn empty_value_is_present_but_default() {
        let bound: Search = Search::schema()
            .bind(&pairs(&[("q", ""), ("limit", "")]))
            .unwrap();
        assert_eq!(bound.q, "");
        assert_eq!(bound.limit, 0);
    }

    #[test]
    fn missing_required_field_errors() {
        let err = Search::schema()
            .bind(&pairs(&[("limit", "5")]))
            .unwrap_err();
        assert!(matches!(err, BindError::MissingField("q")));
    }

    #[test]
    fn invalid_scalar_reports_field() {
        let err = Search::schema()
            .bind(&pairs(&[("q", "x"), ("limit", "lots")]))
            .unwrap_err();
        assert!(matches!(err, BindError::InvalidValue("limit")));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let bound: Search = Search::schema()
            .bind(&pairs(&[("q", "x"), ("mystery", "y")]))
            .unwrap();
        assert_eq!(bound.q, "x");
    }

    fn ctx_for(raw: &[u8]) -> Context {
        let (request, _) = Request::parse(raw).unwrap();
        let ctx = Context::idle();
        ctx.reset(request, Box::new(BufferSink::new(true)), None, false);
        ctx
    }

    #[test]
    fn bind_query_from_request() {
        let ctx = ctx_for(b"GET /search?q=trees&limit=10&tags=x&tags=y HTTP/1.1\r\n\r\n");
        let bound: Search = ctx.bind_query().unwrap();
        assert_eq!(
            bound,
            Search {
                q: "trees".to_string(),
                limit: 10,
                tags: vec!["x".to_string(), "y".to_string()],
            }
        );
    }

    #[test]
    fn bind_form_from_body() {
        let raw = b"POST /search HTTP/1.1\r\nContent-Length: 14\r\n\r\nq=disk&limit=3";
        let ctx = ctx_for(raw);
        let bound: Search = ctx.bind_form().unwrap();
        assert_eq!(bound.q, "disk");
        assert_eq!(bound.limit, 3);
    }

    #[test]
    fn bind_json_goes_through_serde() {
        #[derive(Deserialize)]
        struct Payload {
            name: String,
        }
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 15\r\n\r\n{\"name\":\"disk\"}";
        let ctx = ctx_for(raw);
        let payload: Payload = ctx.bind_json().unwrap();
        assert_eq!(payload.name, "disk");
    }

    #[test]
    fn schema_is_memoized() {
        let a = schema_of::<Search>();
        let b = schema_of::<Search>();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
