//! XtremIO client speaking the XMS JSON REST API.
//!
//! Volumes of a cluster live in a volume folder named after the cluster id,
//! host groups are initiator groups and mappings are `lun-maps`. XtremIO has
//! no pools, so the cluster's free capacity is reported as a single pool.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

use super::http::{RestClient, RestResponse, endpoint_url};
use super::{
    ArrayClient, ArrayError, ArrayFamily, ArrayFuture, HostGroup, Initiator, Lun, StoragePool,
    TargetPortal,
};
use crate::volume::ClusterId;

mod types;

use types::{
    ClusterInfo, Content, Fault, XioGroup, XioInitiator, XioPortal, XioVolume, assemble_groups,
    fault, listing, software_version,
};

const MINIMUM_VERSION: (u32, u32) = (2, 4);
const MIB: u64 = 1 << 20;
const DEFAULT_TARGET_GROUP: &str = "Default";

/// XMS management client bound to one cluster's volume folder.
#[derive(Clone, Debug)]
pub struct XtremIoClient {
    rest: RestClient,
    folder: String,
}

impl XtremIoClient {
    /// Builds a client for the XMS at `endpoint`.
    #[must_use]
    pub fn new(
        endpoint: &str,
        user: &str,
        password: &str,
        cluster: ClusterId,
        verify_tls: bool,
    ) -> Self {
        Self {
            rest: RestClient::new(
                endpoint_url(endpoint, "/api/json/types"),
                user,
                password,
                verify_tls,
            ),
            folder: format!("/{cluster}"),
        }
    }

    /// Checks the XMS version and makes sure the cluster's volume folder
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns [`ArrayError::Unsupported`] for XMS releases older than 2.4
    /// and any transport or API failure.
    pub async fn connect(self) -> Result<Self, ArrayError> {
        let cluster = self.cluster().await?;
        let version = software_version(&cluster.version)
            .ok_or_else(|| ArrayError::unexpected(format!("XMS version {}", cluster.version)))?;
        if version < MINIMUM_VERSION {
            return Err(ArrayError::Unsupported {
                operation: format!("XMS version {} (2.4 or newer required)", cluster.version),
            });
        }
        debug!(version = %cluster.version, cluster = %cluster.name, "connected to XMS");
        self.ensure_folder().await?;
        Ok(self)
    }

    async fn cluster(&self) -> Result<ClusterInfo, ArrayError> {
        let response = self
            .rest
            .send(self.rest.authorized(Method::GET, "clusters/1"))
            .await?;
        Ok(response.success_json::<Content<ClusterInfo>>()?.content)
    }

    async fn ensure_folder(&self) -> Result<(), ArrayError> {
        if self
            .named::<serde_json::Value>("volume-folders", &self.folder)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let caption = self.folder.trim_start_matches('/');
        let response = self
            .rest
            .send(
                self.rest
                    .authorized(Method::POST, "volume-folders")
                    .json(&json!({ "caption": caption, "parent-folder-id": "/" })),
            )
            .await?;
        if response.is_success() || fault(&response) == Fault::NameNotUnique {
            info!(folder = %self.folder, "volume folder ready");
            return Ok(());
        }
        Err(response.into_error())
    }

    async fn named<T: DeserializeOwned>(
        &self,
        kind: &str,
        name: &str,
    ) -> Result<Option<T>, ArrayError> {
        let response = self
            .rest
            .send(
                self.rest
                    .authorized(Method::GET, kind)
                    .query(&[("name", name)]),
            )
            .await?;
        if response.is_success() {
            return Ok(Some(response.json::<Content<T>>()?.content));
        }
        match fault(&response) {
            Fault::NotFound => Ok(None),
            _ => Err(response.into_error()),
        }
    }

    async fn list<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>, ArrayError> {
        let response = self
            .rest
            .send(
                self.rest
                    .authorized(Method::GET, kind)
                    .query(&[("full", "1")]),
            )
            .await?;
        listing(response, kind)
    }

    async fn post(&self, kind: &str, body: serde_json::Value) -> Result<RestResponse, ArrayError> {
        self.rest
            .send(self.rest.authorized(Method::POST, kind).json(&body))
            .await
    }

    async fn delete_named(&self, kind: &str, name: &str) -> Result<(), ArrayError> {
        let response = self
            .rest
            .send(
                self.rest
                    .authorized(Method::DELETE, kind)
                    .query(&[("name", name)]),
            )
            .await?;
        if response.is_success() {
            return Ok(());
        }
        match fault(&response) {
            Fault::NotFound => Err(ArrayError::not_found(kind, name)),
            _ => Err(response.into_error()),
        }
    }

    async fn volume(&self, name: &str) -> Result<Option<XioVolume>, ArrayError> {
        self.named("volumes", name).await
    }

    async fn fetch_groups(&self) -> Result<Vec<HostGroup>, ArrayError> {
        let groups: Vec<XioGroup> = self.list("initiator-groups").await?;
        let initiators: Vec<XioInitiator> = self.list("initiators").await?;
        let volumes: Vec<XioVolume> = self.list("volumes").await?;
        Ok(assemble_groups(groups, &initiators, &volumes))
    }
}

impl ArrayClient for XtremIoClient {
    fn family(&self) -> ArrayFamily {
        ArrayFamily::XtremIo
    }

    fn pools(&self) -> ArrayFuture<'_, Vec<StoragePool>> {
        Box::pin(async move { Ok(vec![self.cluster().await?.as_pool()]) })
    }

    fn lun<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<Lun>> {
        Box::pin(async move { Ok(self.volume(name).await?.map(|volume| volume.to_lun())) })
    }

    fn luns(&self) -> ArrayFuture<'_, Vec<Lun>> {
        Box::pin(async move {
            let volumes: Vec<XioVolume> = self.list("volumes").await?;
            Ok(volumes.iter().map(XioVolume::to_lun).collect())
        })
    }

    fn create_lun<'a>(
        &'a self,
        _pool: &'a StoragePool,
        name: &'a str,
        size_bytes: u64,
    ) -> ArrayFuture<'a, Lun> {
        Box::pin(async move {
            let body = json!({
                "vol-name": name,
                "vol-size": format!("{}m", size_bytes.div_ceil(MIB)),
                "parent-folder-id": self.folder,
            });
            let response = self.post("volumes", body).await?;
            if !response.is_success() {
                return Err(match fault(&response) {
                    Fault::NameNotUnique => ArrayError::NameInUse {
                        name: name.to_owned(),
                    },
                    _ => response.into_error(),
                });
            }
            self.lun(name)
                .await?
                .ok_or_else(|| ArrayError::unexpected(format!("created volume {name} is missing")))
        })
    }

    fn delete_lun<'a>(&'a self, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        Box::pin(async move { self.delete_named("volumes", &lun.name).await })
    }

    fn resize_lun<'a>(&'a self, lun: &'a Lun, size_bytes: u64) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let request = self
                .rest
                .authorized(Method::PUT, "volumes")
                .query(&[("name", lun.name.as_str())])
                .json(&json!({ "vol-size": format!("{}m", size_bytes.div_ceil(MIB)) }));
            let response = self.rest.send(request).await?;
            if response.is_success() {
                return Ok(());
            }
            match fault(&response) {
                Fault::NotFound => Err(ArrayError::not_found("volumes", &lun.name)),
                _ => Err(response.into_error()),
            }
        })
    }

    fn host_groups(&self) -> ArrayFuture<'_, Vec<HostGroup>> {
        Box::pin(self.fetch_groups())
    }

    fn host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<HostGroup>> {
        Box::pin(async move {
            if self
                .named::<XioGroup>("initiator-groups", name)
                .await?
                .is_none()
            {
                return Ok(None);
            }
            Ok(self
                .fetch_groups()
                .await?
                .into_iter()
                .find(|group| group.name == name))
        })
    }

    fn create_host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, HostGroup> {
        Box::pin(async move {
            let response = self
                .post("initiator-groups", json!({ "ig-name": name }))
                .await?;
            if !response.is_success() {
                return Err(match fault(&response) {
                    Fault::NameNotUnique => ArrayError::NameInUse {
                        name: name.to_owned(),
                    },
                    _ => response.into_error(),
                });
            }
            info!(group = name, "created initiator group");
            self.host_group(name)
                .await?
                .ok_or_else(|| ArrayError::not_found("initiator-groups", name))
        })
    }

    fn register_initiator<'a>(
        &'a self,
        group: &'a HostGroup,
        initiator: &'a Initiator,
    ) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let body = json!({
                "initiator-name": initiator.id,
                "ig-id": group.name,
                "port-address": initiator.id,
            });
            let response = self.post("initiators", body).await?;
            if response.is_success() {
                info!(group = %group.name, initiator = %initiator.id, "registered initiator");
                return Ok(());
            }
            Err(match fault(&response) {
                Fault::NameNotUnique => ArrayError::NameInUse {
                    name: initiator.id.clone(),
                },
                _ => response.into_error(),
            })
        })
    }

    fn map_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, u32> {
        Box::pin(async move {
            let response = self
                .post(
                    "lun-maps",
                    json!({ "ig-id": group.name, "vol-id": lun.name }),
                )
                .await?;
            if !response.is_success() {
                return Err(match fault(&response) {
                    Fault::AlreadyMapped => ArrayError::AlreadyMapped {
                        lun: lun.name.clone(),
                        group: group.name.clone(),
                    },
                    Fault::NotFound => ArrayError::not_found("volumes", &lun.name),
                    _ => response.into_error(),
                });
            }
            let refreshed = self
                .host_group(&group.name)
                .await?
                .ok_or_else(|| ArrayError::not_found("initiator-groups", &group.name))?;
            refreshed.hlu_for(lun).ok_or_else(|| {
                ArrayError::unexpected(format!("lun map of {} has no lun number", lun.name))
            })
        })
    }

    fn unmap_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let target_group: XioGroup = self
                .named("target-groups", DEFAULT_TARGET_GROUP)
                .await?
                .ok_or_else(|| ArrayError::not_found("target-groups", DEFAULT_TARGET_GROUP))?;
            let map_name = format!("{}_{}_{}", lun.id, group.id, target_group.index);
            debug!(lun_map = %map_name, "removing lun map");
            self.delete_named("lun-maps", &map_name).await
        })
    }

    fn target_portals(&self) -> ArrayFuture<'_, Vec<TargetPortal>> {
        Box::pin(async move {
            let portals: Vec<XioPortal> = self.list("iscsi-portals").await?;
            Ok(portals.iter().map(XioPortal::to_portal).collect())
        })
    }
}
