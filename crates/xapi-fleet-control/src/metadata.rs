//! Side-channel metadata stored in the `other_config` map of remote objects.
//!
//! Keys are namespaced as `xo:<snake_case key>`; values are JSON documents
//! stored as strings.

use serde_json::Value;
use xapi_fleet_core::ObjectId;
use xapi_fleet_session::SessionError;
use xapi_fleet_store::Store;

use crate::error::{ControlError, Result};
use crate::service::PoolManager;
use crate::types::RawObject;

const KEY_PREFIX: &str = "xo:";

/// Convert `camelCase` to `snake_case`.
///
/// An underscore is inserted before every uppercase letter that follows a
/// lowercase letter or a digit, then the result is lowercased.
#[must_use]
pub fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut previous: Option<char> = None;
    for c in key.chars() {
        if c.is_ascii_uppercase()
            && previous.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit())
        {
            out.push('_');
        }
        out.push(c);
        previous = Some(c);
    }
    out.to_lowercase()
}

/// The `other_config` key holding metadata `key`.
#[must_use]
pub fn data_key(key: &str) -> String {
    format!("{KEY_PREFIX}{}", camel_to_snake(key))
}

impl<S: Store + 'static> PoolManager<S> {
    /// Read a metadata value of an object.
    ///
    /// Returns `None` if the key is not set.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NoSuchObject` if the object is unknown,
    /// `ControlError::NoSuchPool` if its connection is gone, and
    /// `ControlError::Internal` if the stored value is not JSON.
    pub fn get_data(&self, id: &ObjectId, key: &str) -> Result<Option<Value>> {
        let object = self.object(id)?;
        let raw = self
            .events_for_server(&object.origin)?
            .get(&object.raw_id)
            .ok_or_else(|| ControlError::NoSuchObject(id.clone()))?;

        let key = data_key(key);
        let Some(encoded) = raw
            .fields
            .get("other_config")
            .and_then(|config| config.get(&key))
            .and_then(Value::as_str)
        else {
            return Ok(None);
        };

        serde_json::from_str(encoded)
            .map(Some)
            .map_err(|e| ControlError::Internal(format!("invalid value for {key} on {id}: {e}")))
    }

    /// Write a metadata value of an object. `Value::Null` removes the key.
    ///
    /// The fresh record is pushed through the origin connection's event
    /// source, so [`get_data`](Self::get_data) and the object store see the
    /// change without waiting for the next event batch.
    ///
    /// # Errors
    ///
    /// Returns a lookup error from
    /// [`session_for_object`](Self::session_for_object) or the failure of
    /// any of the calls.
    pub async fn set_data(&self, id: &ObjectId, key: &str, value: Value) -> Result<()> {
        let object = self.object(id)?;
        let session = self.session_for_object(&object)?;
        let events = self.events_for_server(&object.origin)?;
        let class = object.kind.remote_class();
        let raw_ref = Value::String(object.raw_id.to_string());
        let key = data_key(key);

        session
            .call(
                &format!("{class}.remove_from_other_config"),
                vec![raw_ref.clone(), Value::String(key.clone())],
            )
            .await?;

        if !value.is_null() {
            let encoded = serde_json::to_string(&value)
                .map_err(|e| ControlError::Internal(format!("cannot encode {key}: {e}")))?;
            session
                .call(
                    &format!("{class}.add_to_other_config"),
                    vec![raw_ref.clone(), Value::String(key.clone()), Value::String(encoded)],
                )
                .await?;
        }

        let record = session
            .call(&format!("{class}.get_record"), vec![raw_ref])
            .await?;
        let Value::Object(fields) = record else {
            return Err(SessionError::Protocol(format!("{class}.get_record returned no record")).into());
        };

        let mut raw = RawObject::new(object.raw_id.clone(), class, fields);
        raw.pool_uuid = object.pool_id.as_ref().map(|pool_id| pool_id.as_str().to_string());
        events.refresh(raw);

        tracing::debug!(id = %id, key = %key, "Metadata updated");
        Ok(())
    }
}
