//! Virtual network interface commands.

use serde_json::Value;
use xapi_fleet_core::ObjectId;
use xapi_fleet_session::RemoteSession;
use xapi_fleet_store::Store;

use crate::error::{ControlError, Result};
use crate::service::PoolManager;
use crate::types::{DomainObject, ObjectKind};

impl<S: Store + 'static> PoolManager<S> {
    fn vif(&self, id: &ObjectId) -> Result<(DomainObject, RemoteSession)> {
        let object = self.object(id)?;
        if object.kind != ObjectKind::Vif {
            return Err(ControlError::WrongKind {
                id: object.id,
                expected: ObjectKind::Vif,
                found: object.kind,
            });
        }
        let session = self.session_for_object(&object)?;
        Ok((object, session))
    }

    async fn vif_call(&self, id: &ObjectId, method: &str, extra: Vec<Value>) -> Result<()> {
        let (vif, session) = self.vif(id)?;
        let mut params = vec![Value::String(vif.raw_id.to_string())];
        params.extend(extra);
        session.call(method, params).await?;

        tracing::debug!(id = %id, method, "VIF command sent");
        Ok(())
    }

    /// Plug a VIF into its running VM.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::WrongKind` if `id` is not a VIF, a lookup error
    /// from [`session_for_object`](Self::session_for_object), or the call's
    /// failure.
    pub async fn connect_vif(&self, id: &ObjectId) -> Result<()> {
        self.vif_call(id, "VIF.plug", Vec::new()).await
    }

    /// Unplug a VIF without waiting for the guest.
    ///
    /// # Errors
    ///
    /// As [`connect_vif`](Self::connect_vif).
    pub async fn disconnect_vif(&self, id: &ObjectId) -> Result<()> {
        self.vif_call(id, "VIF.unplug_force", Vec::new()).await
    }

    /// Destroy a VIF.
    ///
    /// # Errors
    ///
    /// As [`connect_vif`](Self::connect_vif).
    pub async fn delete_vif(&self, id: &ObjectId) -> Result<()> {
        self.vif_call(id, "VIF.destroy", Vec::new()).await
    }

    /// Replace the addresses a VIF may use. Only the given families change.
    ///
    /// # Errors
    ///
    /// As [`connect_vif`](Self::connect_vif). A failure of the IPv4 update
    /// skips the IPv6 update.
    pub async fn set_vif_allowed_addresses(
        &self,
        id: &ObjectId,
        ipv4: Option<Vec<String>>,
        ipv6: Option<Vec<String>>,
    ) -> Result<()> {
        if let Some(addresses) = ipv4 {
            self.vif_call(id, "VIF.set_ipv4_allowed", vec![Value::from(addresses)])
                .await?;
        }
        if let Some(addresses) = ipv6 {
            self.vif_call(id, "VIF.set_ipv6_allowed", vec![Value::from(addresses)])
                .await?;
        }
        Ok(())
    }
}
