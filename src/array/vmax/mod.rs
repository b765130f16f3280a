//! VMAX client speaking the Unisphere for VMAX REST API.
//!
//! Pools are storage resource pools. New volumes are created into a per-SRP
//! default storage group; attaching adds the volume to a per-host storage
//! group that a per-host masking view exposes through the configured port
//! group. Volume identity is kept in the metadata store, so LUN names only
//! need to be unique.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::http::{RestClient, RestResponse, endpoint_url};
use super::{
    ArrayClient, ArrayError, ArrayFamily, ArrayFuture, HostGroup, Initiator, Lun, LunMapping,
    StoragePool,
};

mod types;

use types::{
    Connections, Fault, IdList, Srp, VmaxHost, VmaxVolume, VolumeQuery, add_existing_volume_payload,
    add_volume_payload, default_storage_group, expand_volume_payload, fault, host_lun,
    host_storage_group, masking_view, masking_view_payload, remove_volume_payload, storage_groups,
};

const DEFAULT_PORT: u16 = 8443;
const API_VERSION: &str = "91";

/// Unisphere client bound to one symmetrix array.
#[derive(Clone, Debug)]
pub struct VmaxClient {
    rest: RestClient,
    array_id: String,
    port_group: String,
}

impl VmaxClient {
    /// Builds a client for the Unisphere at `endpoint`.
    ///
    /// `port` defaults to 8443; `port_group` is the port group every
    /// per-host masking view is bound to.
    #[must_use]
    pub fn new(
        endpoint: &str,
        port: Option<u16>,
        user: &str,
        password: &str,
        array_id: &str,
        port_group: &str,
        verify_tls: bool,
    ) -> Self {
        let authority = if endpoint.contains("://") || endpoint.rsplit_once(':').is_some() {
            endpoint.to_owned()
        } else {
            format!("{endpoint}:{}", port.unwrap_or(DEFAULT_PORT))
        };
        let path = format!("/univmax/restapi/{API_VERSION}/sloprovisioning/symmetrix/{array_id}");
        Self {
            rest: RestClient::new(endpoint_url(&authority, &path), user, password, verify_tls),
            array_id: array_id.to_owned(),
            port_group: port_group.to_owned(),
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<RestResponse, ArrayError> {
        let base = self.rest.authorized(method, path);
        let request = match body {
            Some(body) => base.json(&body),
            None => base,
        };
        self.rest.send(request).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ArrayError> {
        self.get_filtered(path, &[]).await
    }

    async fn get_filtered<T: DeserializeOwned>(
        &self,
        path: &str,
        filter: &[(&str, &str)],
    ) -> Result<Option<T>, ArrayError> {
        let response = self
            .rest
            .send(self.rest.authorized(Method::GET, path).query(filter))
            .await?;
        if response.is_success() {
            return response.json().map(Some);
        }
        match fault(&response) {
            Fault::NotFound => Ok(None),
            _ => Err(response.into_error()),
        }
    }

    /// Sends a modifying call; `AlreadyExists` answers count as success.
    async fn idempotent(&self, method: Method, path: &str, body: Value) -> Result<(), ArrayError> {
        let response = self.send(method, path, Some(body)).await?;
        if response.is_success() || fault(&response) == Fault::AlreadyExists {
            return Ok(());
        }
        Err(response.into_error())
    }

    async fn volume(&self, id: &str) -> Result<Option<VmaxVolume>, ArrayError> {
        self.get(&format!("volume/{id}")).await
    }

    async fn query_volumes(&self, filter: &str) -> Result<Vec<VmaxVolume>, ArrayError> {
        let ids = self
            .get_filtered::<VolumeQuery>("volume", &[("volume_identifier", filter)])
            .await?
            .map(VolumeQuery::ids)
            .unwrap_or_default();
        let mut volumes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(volume) = self.volume(&id).await? {
                volumes.push(volume);
            }
        }
        Ok(volumes)
    }

    async fn ensure_storage_group(&self, name: &str, srp: &str) -> Result<(), ArrayError> {
        if self
            .get::<Value>(&format!("storagegroup/{name}"))
            .await?
            .is_some()
        {
            return Ok(());
        }
        info!(storage_group = name, srp, "creating storage group");
        self.idempotent(
            Method::POST,
            "storagegroup",
            json!({ "storageGroupId": name, "srpId": srp, "emulation": "FBA" }),
        )
        .await
    }

    async fn ensure_masking_view(&self, host: &str) -> Result<(), ArrayError> {
        let view = masking_view(host);
        if self
            .get::<Value>(&format!("maskingview/{view}"))
            .await?
            .is_some()
        {
            return Ok(());
        }
        info!(masking_view = %view, port_group = %self.port_group, "creating masking view");
        self.idempotent(
            Method::POST,
            "maskingview",
            masking_view_payload(host, &self.port_group),
        )
        .await
    }

    async fn connections(&self, host: &str) -> Result<Vec<LunMapping>, ArrayError> {
        let Some(found) = self
            .get::<Connections>(&format!("maskingview/{}/connections", masking_view(host)))
            .await?
        else {
            return Ok(Vec::new());
        };
        let mut mappings: Vec<LunMapping> = Vec::new();
        for connection in found.masking_view_connection {
            // One row per path; keep a single mapping per volume.
            if mappings.iter().any(|known| known.lun_id == connection.volume_id) {
                continue;
            }
            match host_lun(&connection.host_lun_address) {
                Some(hlu) => mappings.push(LunMapping {
                    lun_id: connection.volume_id,
                    hlu,
                }),
                None => warn!(
                    volume = %connection.volume_id,
                    address = %connection.host_lun_address,
                    "ignoring unreadable host lun address"
                ),
            }
        }
        Ok(mappings)
    }

    async fn host(&self, name: &str) -> Result<Option<HostGroup>, ArrayError> {
        let Some(host) = self.get::<VmaxHost>(&format!("host/{name}")).await? else {
            return Ok(None);
        };
        let mappings = if host.maskingview.is_empty() {
            Vec::new()
        } else {
            self.connections(&host.host_id).await?
        };
        Ok(Some(HostGroup {
            id: host.host_id.clone(),
            name: host.host_id,
            initiators: host.initiator,
            mappings,
        }))
    }
}

impl ArrayClient for VmaxClient {
    fn family(&self) -> ArrayFamily {
        ArrayFamily::Vmax
    }

    fn pools(&self) -> ArrayFuture<'_, Vec<StoragePool>> {
        Box::pin(async move {
            let ids = self.get::<IdList>("srp").await?.unwrap_or_default();
            let mut pools = Vec::with_capacity(ids.srp_id.len());
            for id in ids.srp_id {
                if let Some(srp) = self.get::<Srp>(&format!("srp/{id}")).await? {
                    pools.push(srp.to_pool());
                }
            }
            Ok(pools)
        })
    }

    fn lun<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<Lun>> {
        Box::pin(async move {
            let mut found = self.query_volumes(name).await?.into_iter();
            let first = found.next();
            if found.next().is_some() {
                warn!(lun = name, "several volumes carry this identifier, using the first");
            }
            Ok(first.map(|volume| volume.to_lun(&self.array_id)))
        })
    }

    fn luns(&self) -> ArrayFuture<'_, Vec<Lun>> {
        Box::pin(async move {
            let volumes = self.query_volumes("<like>FLOCKER").await?;
            Ok(volumes
                .iter()
                .map(|volume| volume.to_lun(&self.array_id))
                .collect())
        })
    }

    fn create_lun<'a>(
        &'a self,
        pool: &'a StoragePool,
        name: &'a str,
        size_bytes: u64,
    ) -> ArrayFuture<'a, Lun> {
        Box::pin(async move {
            // Identifiers are not unique on VMAX, so collisions are checked here.
            if self.lun(name).await?.is_some() {
                return Err(ArrayError::NameInUse {
                    name: name.to_owned(),
                });
            }
            let group = default_storage_group(&pool.id);
            self.ensure_storage_group(&group, &pool.id).await?;
            self.send(
                Method::PUT,
                &format!("storagegroup/{group}"),
                Some(add_volume_payload(name, size_bytes)),
            )
            .await?
            .success()?;
            info!(lun = name, storage_group = %group, "created VMAX volume");
            self.lun(name)
                .await?
                .ok_or_else(|| ArrayError::unexpected(format!("created volume {name} is missing")))
        })
    }

    fn delete_lun<'a>(&'a self, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            for group in storage_groups(lun) {
                debug!(lun = %lun.name, storage_group = %group, "removing volume from storage group");
                self.send(
                    Method::PUT,
                    &format!("storagegroup/{group}"),
                    Some(remove_volume_payload(&lun.id)),
                )
                .await?
                .success()?;
            }
            let response = self
                .send(Method::DELETE, &format!("volume/{}", lun.id), None)
                .await?;
            if response.is_success() {
                return Ok(());
            }
            match fault(&response) {
                Fault::NotFound => Err(ArrayError::not_found("volume", &lun.name)),
                _ => Err(response.into_error()),
            }
        })
    }

    fn resize_lun<'a>(&'a self, lun: &'a Lun, size_bytes: u64) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            self.send(
                Method::PUT,
                &format!("volume/{}", lun.id),
                Some(expand_volume_payload(size_bytes)),
            )
            .await?
            .success()
        })
    }

    fn host_groups(&self) -> ArrayFuture<'_, Vec<HostGroup>> {
        Box::pin(async move {
            let ids = self.get::<IdList>("host").await?.unwrap_or_default();
            let mut hosts = Vec::with_capacity(ids.host_id.len());
            for id in ids.host_id {
                hosts.extend(self.host(&id).await?);
            }
            Ok(hosts)
        })
    }

    fn host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<HostGroup>> {
        Box::pin(self.host(name))
    }

    /// VMAX hosts cannot exist without initiators, so the host object is
    /// created together with its first initiator in `register_initiator`.
    fn create_host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, HostGroup> {
        Box::pin(async move {
            Ok(HostGroup {
                id: name.to_owned(),
                name: name.to_owned(),
                initiators: Vec::new(),
                mappings: Vec::new(),
            })
        })
    }

    fn register_initiator<'a>(
        &'a self,
        group: &'a HostGroup,
        initiator: &'a Initiator,
    ) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let exists = self
                .get::<VmaxHost>(&format!("host/{}", group.name))
                .await?
                .is_some();
            if exists {
                self.idempotent(
                    Method::PUT,
                    &format!("host/{}", group.name),
                    json!({
                        "editHostActionParam": {
                            "addInitiatorParam": { "initiator": [initiator.id] },
                        },
                    }),
                )
                .await?;
            } else {
                self.idempotent(
                    Method::POST,
                    "host",
                    json!({ "hostId": group.name, "initiatorId": [initiator.id] }),
                )
                .await?;
            }
            info!(host = %group.name, initiator = %initiator.id, "registered initiator");
            Ok(())
        })
    }

    fn map_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, u32> {
        Box::pin(async move {
            let host_group_name = host_storage_group(&group.name);
            if let Some(holder) = storage_groups(lun)
                .into_iter()
                .find(|sg| sg.ends_with("_SG") && !sg.starts_with("FLOCKER_") && *sg != host_group_name)
            {
                return Err(ArrayError::AlreadyMapped {
                    lun: lun.name.clone(),
                    group: holder,
                });
            }
            self.ensure_storage_group(&host_group_name, "None").await?;
            self.idempotent(
                Method::PUT,
                &format!("storagegroup/{host_group_name}"),
                add_existing_volume_payload(&lun.id),
            )
            .await?;
            self.ensure_masking_view(&group.name).await?;
            self.connections(&group.name)
                .await?
                .into_iter()
                .find(|mapping| mapping.lun_id == lun.id)
                .map(|mapping| mapping.hlu)
                .ok_or_else(|| {
                    ArrayError::unexpected(format!("{} has no host lun address", lun.name))
                })
        })
    }

    fn unmap_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let storage_group = host_storage_group(&group.name);
            let response = self
                .send(
                    Method::PUT,
                    &format!("storagegroup/{storage_group}"),
                    Some(remove_volume_payload(&lun.id)),
                )
                .await?;
            if response.is_success() {
                return Ok(());
            }
            match fault(&response) {
                Fault::NotFound => Err(ArrayError::not_found("storage group", storage_group)),
                _ => Err(response.into_error()),
            }
        })
    }
}
