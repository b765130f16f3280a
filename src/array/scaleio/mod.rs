//! ScaleIO client speaking the REST gateway.
//!
//! The gateway trades the configured credentials for a session token at
//! `/api/login`; every later call authenticates with that token. Pools are the
//! storage pools of one protection domain and SDCs play the part of host
//! groups. SDCs register themselves, so they cannot be created from here.

use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::http::{RestClient, RestResponse, endpoint_url};
use super::{
    ArrayClient, ArrayError, ArrayFamily, ArrayFuture, HostGroup, Initiator, Lun, StoragePool,
};

mod types;

use types::{Fault, Named, PoolStatistics, Sdc, SioVolume, fault, json_string, sdc_groups};

const KIB: u64 = 1024;
const GIB: u64 = 1 << 30;

/// ScaleIO gateway client scoped to one protection domain.
#[derive(Debug)]
pub struct ScaleIoClient {
    rest: RestClient,
    protection_domain: String,
    storage_pool: Option<String>,
    token: Mutex<Option<String>>,
}

impl ScaleIoClient {
    /// Builds a client for the gateway at `endpoint`.
    ///
    /// `storage_pool` narrows provisioning to one pool of the domain.
    #[must_use]
    pub fn new(
        endpoint: &str,
        user: &str,
        password: &str,
        protection_domain: &str,
        storage_pool: Option<&str>,
        verify_tls: bool,
    ) -> Self {
        Self {
            rest: RestClient::new(endpoint_url(endpoint, "/api"), user, password, verify_tls),
            protection_domain: protection_domain.to_owned(),
            storage_pool: storage_pool.map(str::to_owned),
            token: Mutex::new(None),
        }
    }

    async fn token(&self) -> Result<String, ArrayError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let response = self
            .rest
            .send(self.rest.authorized(Method::GET, "login"))
            .await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        let token = json_string(&response);
        debug!(user = self.rest.user(), "logged in to ScaleIO gateway");
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        shape: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<RestResponse, ArrayError> {
        let token = self.token().await?;
        let request = self
            .rest
            .request(method, path)
            .basic_auth(self.rest.user(), Some(token));
        let response = self.rest.send(shape(request)).await?;
        if response.status.as_u16() == 401 {
            // Tokens expire after inactivity; the next call logs in again.
            *self.token.lock().await = None;
        }
        Ok(response)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ArrayError> {
        self.call(Method::GET, path, |request| request)
            .await?
            .success_json()
    }

    async fn action(&self, path: &str, body: Value) -> Result<RestResponse, ArrayError> {
        self.call(Method::POST, path, |request| request.json(&body))
            .await
    }

    async fn domain(&self) -> Result<Named, ArrayError> {
        let domains: Vec<Named> = self.get("types/ProtectionDomain/instances").await?;
        domains
            .into_iter()
            .find(|domain| domain.name == self.protection_domain)
            .ok_or_else(|| ArrayError::not_found("protection domain", &self.protection_domain))
    }

    async fn volume_by_name(&self, name: &str) -> Result<Option<SioVolume>, ArrayError> {
        let response = self
            .action(
                "types/Volume/instances/action/queryIdByKey",
                json!({ "name": name }),
            )
            .await?;
        if !response.is_success() {
            return match fault(&response) {
                Fault::NotFound => Ok(None),
                _ => Err(response.into_error()),
            };
        }
        let id = json_string(&response);
        self.get(&format!("instances/Volume::{id}")).await.map(Some)
    }

    async fn volumes(&self) -> Result<Vec<SioVolume>, ArrayError> {
        self.get("types/Volume/instances").await
    }

    async fn volume_action(&self, lun: &Lun, action: &str, body: Value) -> Result<RestResponse, ArrayError> {
        self.action(&format!("instances/Volume::{}/action/{action}", lun.id), body)
            .await
    }

    async fn fetch_sdcs(&self) -> Result<Vec<HostGroup>, ArrayError> {
        let sdcs: Vec<Sdc> = self.get("types/Sdc/instances").await?;
        let volumes = self.volumes().await?;
        Ok(sdc_groups(sdcs, &volumes))
    }
}

impl ArrayClient for ScaleIoClient {
    fn family(&self) -> ArrayFamily {
        ArrayFamily::ScaleIo
    }

    fn pools(&self) -> ArrayFuture<'_, Vec<StoragePool>> {
        Box::pin(async move {
            let domain = self.domain().await?;
            let pools: Vec<Named> = self
                .get(&format!(
                    "instances/ProtectionDomain::{}/relationships/StoragePool",
                    domain.id
                ))
                .await?;
            let mut found = Vec::new();
            for pool in pools {
                if self
                    .storage_pool
                    .as_deref()
                    .is_some_and(|wanted| wanted != pool.name)
                {
                    continue;
                }
                let stats: PoolStatistics = self
                    .get(&format!(
                        "instances/StoragePool::{}/relationships/Statistics",
                        pool.id
                    ))
                    .await?;
                found.push(stats.to_pool(pool));
            }
            Ok(found)
        })
    }

    fn lun<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<Lun>> {
        Box::pin(async move { Ok(self.volume_by_name(name).await?.map(|volume| volume.to_lun())) })
    }

    fn luns(&self) -> ArrayFuture<'_, Vec<Lun>> {
        Box::pin(async move { Ok(self.volumes().await?.iter().map(SioVolume::to_lun).collect()) })
    }

    fn create_lun<'a>(
        &'a self,
        pool: &'a StoragePool,
        name: &'a str,
        size_bytes: u64,
    ) -> ArrayFuture<'a, Lun> {
        Box::pin(async move {
            let domain = self.domain().await?;
            let body = json!({
                "name": name,
                "protectionDomainId": domain.id,
                "storagePoolId": pool.id,
                "volumeSizeInKb": size_bytes.div_ceil(KIB).to_string(),
                "volumeType": "ThinProvisioned",
            });
            let response = self.action("types/Volume/instances", body).await?;
            if !response.is_success() {
                return Err(match fault(&response) {
                    Fault::NameInUse => ArrayError::NameInUse {
                        name: name.to_owned(),
                    },
                    _ => response.into_error(),
                });
            }
            info!(volume = name, pool = %pool.name, "created ScaleIO volume");
            self.lun(name)
                .await?
                .ok_or_else(|| ArrayError::unexpected(format!("created volume {name} is missing")))
        })
    }

    fn delete_lun<'a>(&'a self, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let response = self
                .volume_action(lun, "removeVolume", json!({ "removeMode": "ONLY_ME" }))
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
            let body = json!({ "sizeInGB": size_bytes.div_ceil(GIB).to_string() });
            self.volume_action(lun, "setVolumeSize", body)
                .await?
                .success()
        })
    }

    fn host_groups(&self) -> ArrayFuture<'_, Vec<HostGroup>> {
        Box::pin(self.fetch_sdcs())
    }

    fn host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<HostGroup>> {
        Box::pin(async move {
            Ok(self
                .fetch_sdcs()
                .await?
                .into_iter()
                .find(|group| group.name.eq_ignore_ascii_case(name)))
        })
    }

    fn create_host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, HostGroup> {
        Box::pin(async move {
            Err(ArrayError::Unsupported {
                operation: format!("creating SDC {name}; install and register the SDC on the host"),
            })
        })
    }

    fn register_initiator<'a>(
        &'a self,
        group: &'a HostGroup,
        initiator: &'a Initiator,
    ) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            if group.has_initiator(&initiator.id) {
                return Ok(());
            }
            Err(ArrayError::Unsupported {
                operation: format!("registering {} with SDC {}", initiator.id, group.name),
            })
        })
    }

    fn map_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, u32> {
        Box::pin(async move {
            let body = json!({ "sdcId": group.id, "allowMultipleMappings": "FALSE" });
            let response = self.volume_action(lun, "addMappedSdc", body).await?;
            if response.is_success() {
                return Ok(0);
            }
            Err(match fault(&response) {
                Fault::AlreadyMapped => ArrayError::AlreadyMapped {
                    lun: lun.name.clone(),
                    group: group.name.clone(),
                },
                _ => response.into_error(),
            })
        })
    }

    fn unmap_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let response = self
                .volume_action(lun, "removeMappedSdc", json!({ "sdcId": group.id }))
                .await?;
            if response.is_success() {
                return Ok(());
            }
            match fault(&response) {
                Fault::NotFound => Err(ArrayError::not_found("sdc mapping", &group.name)),
                _ => Err(response.into_error()),
            }
        })
    }
}
