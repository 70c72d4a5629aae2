use std::borrow::Cow;

use ::metrics::{
    metric_tag_const_value,
    MetricTag,
};
use prometheus::IntCounter;

mod metrics;

/// ErrorMetadata object can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object used across the
/// workspace to tag errors with information that is used to classify.
///
/// The short_msg is used as a tag - available for tests and for metrics
/// logging - to have a message that is resilient to changes in copy.
///
/// Every error raised by a table operation carries the key(s) it is about, so
/// callers can decide which rows to re-read before retrying the transaction.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching
    /// w/ a standard test helper.
    /// Eg TupleExists
    pub short_msg: Cow<'static, str>,
    /// human readable - developer facing. Should be longer and descriptive.
    pub msg: Cow<'static, str>,
    /// Primary keys the error is about. Empty for errors not tied to a row.
    pub keys: Vec<u64>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Insert on a key that already has a visible value.
    TupleExists,
    /// Get, update or remove on a key with no visible value.
    TupleDoesNotExist,
    /// The caller's view of a row is stale, or the remote store rejected a
    /// conditional write because of a concurrent modification.
    Conflict,
    NotFound,
    BadRequest,
}

impl ErrorMetadata {
    pub fn tuple_exists(key: u64) -> Self {
        Self {
            code: ErrorCode::TupleExists,
            short_msg: TUPLE_EXISTS.into(),
            msg: format!("Tuple with key {key} already exists").into(),
            keys: vec![key],
        }
    }

    pub fn tuple_does_not_exist(key: u64) -> Self {
        Self {
            code: ErrorCode::TupleDoesNotExist,
            short_msg: TUPLE_DOES_NOT_EXIST.into(),
            msg: format!("Tuple with key {key} does not exist").into(),
            keys: vec![key],
        }
    }

    /// The tuple the caller passed as the current value of `key` does not
    /// match what this transaction sees.
    pub fn conflict(key: u64) -> Self {
        Self {
            code: ErrorCode::Conflict,
            short_msg: CONFLICT.into(),
            msg: format!("Tuple with key {key} was modified concurrently").into(),
            keys: vec![key],
        }
    }

    /// Write-back was rejected by the remote store for every key in `keys`.
    pub fn conflicts(keys: Vec<u64>) -> Self {
        let listed = keys
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            code: ErrorCode::Conflict,
            short_msg: CONFLICT.into(),
            msg: format!("Tuples with keys [{listed}] were modified concurrently").into(),
            keys,
        }
    }

    /// Resource not found.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error (eg
    /// TableNotFound). The msg should be a descriptive message targeted
    /// toward the developer.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
            keys: vec![],
        }
    }

    /// Bad Request.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error.
    /// The msg should be a descriptive message targeted toward the developer.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
            keys: vec![],
        }
    }

    pub fn is_tuple_exists(&self) -> bool {
        self.code == ErrorCode::TupleExists
    }

    pub fn is_tuple_does_not_exist(&self) -> bool {
        self.code == ErrorCode::TupleDoesNotExist
    }

    pub fn is_conflict(&self) -> bool {
        self.code == ErrorCode::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    /// True for errors that mean the transaction's view is out of date, where
    /// retrying the whole transaction from a fresh snapshot can succeed.
    pub fn is_retriable(&self) -> bool {
        match self.code {
            ErrorCode::Conflict | ErrorCode::TupleExists | ErrorCode::TupleDoesNotExist => true,
            ErrorCode::NotFound | ErrorCode::BadRequest => false,
        }
    }

    fn metric_status_tag_value(&self) -> &'static str {
        match self.code {
            ErrorCode::TupleExists => "tuple_exists",
            ErrorCode::TupleDoesNotExist => "tuple_does_not_exist",
            ErrorCode::Conflict => "conflict",
            ErrorCode::NotFound => "not_found",
            ErrorCode::BadRequest => "bad_request",
        }
    }

    pub fn metric_status_tag(&self) -> MetricTag {
        metric_tag_const_value("status", self.metric_status_tag_value())
    }

    pub fn custom_metric(&self) -> Option<&'static IntCounter> {
        match self.code {
            ErrorCode::TupleExists => Some(&crate::metrics::TUPLE_EXISTS_ERROR_TOTAL),
            ErrorCode::TupleDoesNotExist => Some(&crate::metrics::TUPLE_DOES_NOT_EXIST_ERROR_TOTAL),
            ErrorCode::Conflict => Some(&crate::metrics::CONFLICT_ERROR_TOTAL),
            ErrorCode::BadRequest => Some(&crate::metrics::BAD_REQUEST_ERROR_TOTAL),
            ErrorCode::NotFound => None,
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_tuple_exists(&self) -> bool;
    fn is_tuple_does_not_exist(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_bad_request(&self) -> bool;
    fn is_retriable(&self) -> bool;
    fn offending_keys(&self) -> &[u64];
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn metric_status_tag_value(&self) -> &'static str;
    fn report_custom_metric(&self);
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    /// Returns true if error is tagged as TupleExists
    fn is_tuple_exists(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_tuple_exists();
        }
        false
    }

    /// Returns true if error is tagged as TupleDoesNotExist
    fn is_tuple_does_not_exist(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_tuple_does_not_exist();
        }
        false
    }

    /// Returns true if error is tagged as Conflict
    fn is_conflict(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_conflict();
        }
        false
    }

    /// Returns true if error is tagged as NotFound
    fn is_not_found(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_not_found();
        }
        false
    }

    /// Returns true if error is tagged as BadRequest
    fn is_bad_request(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_bad_request();
        }
        false
    }

    /// Untagged errors are system faults and never retriable.
    fn is_retriable(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_retriable();
        }
        false
    }

    /// Return the keys the error is about
    fn offending_keys(&self) -> &[u64] {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.keys;
        }
        &[]
    }

    /// Return the short_msg associated with this Error
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_ERROR
    }

    /// Return the descriptive msg associated with this Error
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_ERROR_MSG
    }

    /// Return the tag to use on a status metric
    fn metric_status_tag_value(&self) -> &'static str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.metric_status_tag_value();
        }
        MetricTag::STATUS_ERROR.split_key_value().1
    }

    fn report_custom_metric(&self) {
        if let Some(counter) = self
            .downcast_ref::<ErrorMetadata>()
            .and_then(ErrorMetadata::custom_metric)
        {
            ::metrics::log_counter(counter, 1);
        }
    }

    fn map_error_metadata<F>(self, f: F) -> Self
    where
        F: FnOnce(ErrorMetadata) -> ErrorMetadata,
    {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>().cloned() {
            return self.context(f(e));
        }
        self
    }

    /// Wrap the underlying error message, maintaining the underlying error
    /// metadata short code if it exists.
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String,
    {
        if let Some(mut em) = self.downcast_ref::<ErrorMetadata>().cloned() {
            em.msg = f(em.msg.to_string()).into();
            return self.context(em);
        }
        let new_msg = f(self.to_string());
        self.context(new_msg)
    }
}

pub const INTERNAL_ERROR_MSG: &str = "The transaction couldn't be completed because of an \
                                      internal error.";
pub const INTERNAL_ERROR: &str = "InternalError";
pub const TUPLE_EXISTS: &str = "TupleExists";
pub const TUPLE_DOES_NOT_EXIST: &str = "TupleDoesNotExist";
pub const CONFLICT: &str = "Conflict";

#[cfg(any(test, feature = "testing"))]
mod arbitrary_impls {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            (any::<ErrorCode>(), prop::collection::vec(any::<u64>(), 1..4))
                .prop_map(|(ec, keys)| match ec {
                    ErrorCode::TupleExists => ErrorMetadata::tuple_exists(keys[0]),
                    ErrorCode::TupleDoesNotExist => ErrorMetadata::tuple_does_not_exist(keys[0]),
                    ErrorCode::Conflict => ErrorMetadata::conflicts(keys),
                    ErrorCode::NotFound => ErrorMetadata::not_found("not", "found"),
                    ErrorCode::BadRequest => ErrorMetadata::bad_request("bad", "request"),
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use crate::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
        CONFLICT,
        INTERNAL_ERROR,
    };

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_row_errors_carry_keys(err in any::<ErrorMetadata>()) {
            // Every retriable error names at least one key and is counted.
            if err.is_retriable() {
                prop_assert!(!err.keys.is_empty());
                prop_assert!(err.custom_metric().is_some());
            }
            let anyhow_err = anyhow::anyhow!("remote failure").context(err.clone());
            prop_assert_eq!(anyhow_err.offending_keys(), &err.keys[..]);
            prop_assert_eq!(anyhow_err.short_msg(), &*err.short_msg);
        }
    }

    #[test]
    fn test_untagged_errors_are_internal() {
        let err = anyhow::anyhow!("connection reset");
        assert!(!err.is_conflict());
        assert!(!err.is_retriable());
        assert_eq!(err.short_msg(), INTERNAL_ERROR);
        assert!(err.offending_keys().is_empty());
        assert_eq!(err.metric_status_tag_value(), "error");
    }

    #[test]
    fn test_conflicts_list_every_key() {
        let err: anyhow::Result<()> = Err(ErrorMetadata::conflicts(vec![3, 9]).into());
        let err = err.context("write back failed").unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.short_msg(), CONFLICT);
        assert_eq!(err.offending_keys(), &[3, 9]);
        assert_eq!(err.metric_status_tag_value(), "conflict");

        let wrapped = err.wrap_error_message(|msg| format!("table accounts: {msg}"));
        assert!(wrapped.is_conflict());
        assert!(wrapped.msg().starts_with("table accounts: "));
    }
}
