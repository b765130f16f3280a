//! Unity client speaking the Unisphere management REST API.
//!
//! Unisphere wants the `X-EMC-REST-CLIENT` header on every call and a CSRF
//! token, bound to the login session cookie, on every modifying call. The
//! session is opened lazily and reused.

use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::http::{RestClient, RestResponse, endpoint_url};
use super::{
    ArrayClient, ArrayError, ArrayFamily, ArrayFuture, HostGroup, Initiator, Lun, StoragePool,
    TargetPortal, Transport,
};

mod types;

use types::{
    CapabilityProfile, Entry, Fault, IdRef, IscsiNode, IscsiPortal, UnityHost, UnityHostLun,
    UnityInitiator, UnityLun, UnityPool, assemble_hosts, collection, fault, portals,
};

const LUN_FIELDS: &str = "id,name,sizeTotal,health,pool,wwn,storageResource";
const CSRF_HEADER: &str = "EMC-CSRF-TOKEN";
/// Host type for a manually registered host.
const HOST_TYPE_MANUAL: u8 = 1;
/// Host access mask granting production access.
const ACCESS_PRODUCTION: u8 = 1;
const INITIATOR_TYPE_FC: u8 = 1;
const INITIATOR_TYPE_ISCSI: u8 = 2;

#[derive(Clone, Debug, Default)]
struct Session {
    cookies: Vec<String>,
    csrf_token: Option<String>,
}

/// Unisphere management client.
#[derive(Debug)]
pub struct UnityClient {
    rest: RestClient,
    session: Mutex<Option<Session>>,
}

impl UnityClient {
    /// Builds a client for the Unisphere at `endpoint`.
    #[must_use]
    pub fn new(endpoint: &str, user: &str, password: &str, verify_tls: bool) -> Self {
        Self {
            rest: RestClient::new(endpoint_url(endpoint, "/api"), user, password, verify_tls),
            session: Mutex::new(None),
        }
    }

    async fn session(&self) -> Result<Session, ArrayError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let response = self
            .rest
            .send(
                self.rest
                    .authorized(Method::GET, "types/loginSessionInfo/instances")
                    .header("X-EMC-REST-CLIENT", "true"),
            )
            .await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        let session = Session {
            cookies: response.cookies(),
            csrf_token: response.header(CSRF_HEADER),
        };
        debug!(user = self.rest.user(), "opened Unisphere session");
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        shape: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<RestResponse, ArrayError> {
        let session = self.session().await?;
        let mut request = self
            .rest
            .authorized(method.clone(), path)
            .header("X-EMC-REST-CLIENT", "true");
        if !session.cookies.is_empty() {
            request = request.header(reqwest::header::COOKIE, session.cookies.join("; "));
        }
        if method != Method::GET {
            if let Some(token) = &session.csrf_token {
                request = request.header(CSRF_HEADER, token);
            }
        }
        let response = self.rest.send(shape(request)).await?;
        if response.status.as_u16() == 401 {
            // Sessions expire; the next call logs in again.
            *self.session.lock().await = None;
        }
        Ok(response)
    }

    async fn list<T: DeserializeOwned>(
        &self,
        kind: &str,
        fields: &str,
        filter: Option<String>,
    ) -> Result<Vec<T>, ArrayError> {
        let path = format!("types/{kind}/instances");
        let response = self
            .call(Method::GET, &path, |request| {
                let projected = request.query(&[("fields", fields), ("compact", "true")]);
                match &filter {
                    Some(filter) => projected.query(&[("filter", filter.as_str())]),
                    None => projected,
                }
            })
            .await?;
        collection(response)
    }

    async fn post(&self, path: &str, body: Value) -> Result<RestResponse, ArrayError> {
        self.call(Method::POST, path, |request| request.json(&body))
            .await
    }

    async fn find_lun(&self, name: &str) -> Result<Option<UnityLun>, ArrayError> {
        let path = format!("instances/lun/name:{name}");
        let response = self
            .call(Method::GET, &path, |request| {
                request.query(&[("fields", LUN_FIELDS)])
            })
            .await?;
        if response.is_success() {
            return Ok(Some(response.json::<Entry<UnityLun>>()?.content));
        }
        match fault(&response) {
            Fault::NotFound => Ok(None),
            _ => Err(response.into_error()),
        }
    }

    async fn modify_lun(&self, lun: &Lun, parameters: Value) -> Result<RestResponse, ArrayError> {
        let resource = lun
            .keys
            .get("storage_resource")
            .map_or(lun.id.as_str(), String::as_str);
        self.post(
            &format!("instances/storageResource/{resource}/action/modifyLun"),
            json!({ "lunParameters": parameters }),
        )
        .await
    }

    async fn fetch_hosts(&self, filter: Option<String>) -> Result<Vec<HostGroup>, ArrayError> {
        let hosts: Vec<UnityHost> = self.list("host", "id,name", filter).await?;
        if hosts.is_empty() {
            return Ok(Vec::new());
        }
        let initiators: Vec<UnityInitiator> = self
            .list("hostInitiator", "id,initiatorId,parentHost", None)
            .await?;
        let host_luns: Vec<UnityHostLun> =
            self.list("hostLUN", "id,host,lun,hlu", None).await?;
        Ok(assemble_hosts(hosts, &initiators, &host_luns))
    }
}

fn name_filter(name: &str) -> String {
    format!("name eq \"{name}\"")
}

impl ArrayClient for UnityClient {
    fn family(&self) -> ArrayFamily {
        ArrayFamily::Unity
    }

    fn pools(&self) -> ArrayFuture<'_, Vec<StoragePool>> {
        Box::pin(async move {
            let pools: Vec<UnityPool> = self
                .list("pool", "id,name,sizeFree,sizeTotal", None)
                .await?;
            Ok(pools.into_iter().map(StoragePool::from).collect())
        })
    }

    fn capability_pools<'a>(&'a self, usage_tag: &'a str) -> ArrayFuture<'a, Vec<String>> {
        Box::pin(async move {
            let profiles: Vec<CapabilityProfile> = self
                .list("capabilityProfile", "id,name,pool,usageTags", None)
                .await?;
            Ok(profiles
                .into_iter()
                .filter(|profile| profile.usage_tags.iter().any(|tag| tag == usage_tag))
                .map(|profile| profile.pool.id)
                .collect())
        })
    }

    fn lun<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<Lun>> {
        Box::pin(async move { Ok(self.find_lun(name).await?.map(|lun| lun.to_lun())) })
    }

    fn luns(&self) -> ArrayFuture<'_, Vec<Lun>> {
        Box::pin(async move {
            let luns: Vec<UnityLun> = self.list("lun", LUN_FIELDS, None).await?;
            Ok(luns.iter().map(UnityLun::to_lun).collect())
        })
    }

    fn create_lun<'a>(
        &'a self,
        pool: &'a StoragePool,
        name: &'a str,
        size_bytes: u64,
    ) -> ArrayFuture<'a, Lun> {
        Box::pin(async move {
            let body = json!({
                "name": name,
                "lunParameters": {
                    "pool": { "id": pool.id },
                    "size": size_bytes,
                    "isThinEnabled": true,
                },
            });
            let response = self
                .post("types/storageResource/action/createLun", body)
                .await?;
            if !response.is_success() {
                return Err(match fault(&response) {
                    Fault::NameInUse => ArrayError::NameInUse {
                        name: name.to_owned(),
                    },
                    _ => response.into_error(),
                });
            }
            self.lun(name)
                .await?
                .ok_or_else(|| ArrayError::unexpected(format!("created lun {name} is missing")))
        })
    }

    fn delete_lun<'a>(&'a self, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            let resource = lun
                .keys
                .get("storage_resource")
                .map_or(lun.id.as_str(), String::as_str);
            let response = self
                .call(
                    Method::DELETE,
                    &format!("instances/storageResource/{resource}"),
                    |request| request,
                )
                .await?;
            if response.is_success() {
                return Ok(());
            }
            match fault(&response) {
                Fault::NotFound => Err(ArrayError::not_found("lun", &lun.name)),
                _ => Err(response.into_error()),
            }
        })
    }

    fn resize_lun<'a>(&'a self, lun: &'a Lun, size_bytes: u64) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            self.modify_lun(lun, json!({ "size": size_bytes }))
                .await?
                .success()
        })
    }

    fn host_groups(&self) -> ArrayFuture<'_, Vec<HostGroup>> {
        Box::pin(self.fetch_hosts(None))
    }

    fn host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, Option<HostGroup>> {
        Box::pin(async move {
            Ok(self
                .fetch_hosts(Some(name_filter(name)))
                .await?
                .into_iter()
                .find(|host| host.name == name))
        })
    }

    fn create_host_group<'a>(&'a self, name: &'a str) -> ArrayFuture<'a, HostGroup> {
        Box::pin(async move {
            let response = self
                .post(
                    "types/host/instances",
                    json!({ "type": HOST_TYPE_MANUAL, "name": name }),
                )
                .await?;
            if !response.is_success() {
                return Err(match fault(&response) {
                    Fault::NameInUse => ArrayError::NameInUse {
                        name: name.to_owned(),
                    },
                    _ => response.into_error(),
                });
            }
            let created = response.json::<Entry<IdRef>>()?.content;
            info!(host = name, id = %created.id, "created host");
            Ok(HostGroup {
                id: created.id,
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
            let initiator_type = match initiator.transport {
                Transport::Fc => INITIATOR_TYPE_FC,
                Transport::Iscsi => INITIATOR_TYPE_ISCSI,
                Transport::Sdc => {
                    return Err(ArrayError::Unsupported {
                        operation: String::from("SDC initiators on Unity"),
                    });
                }
            };
            let body = json!({
                "host": { "id": group.id },
                "initiatorType": initiator_type,
                "initiatorWWNorIqn": initiator.id,
            });
            let response = self.post("types/hostInitiator/instances", body).await?;
            if response.is_success() {
                info!(host = %group.name, initiator = %initiator.id, "registered initiator");
                return Ok(());
            }
            Err(match fault(&response) {
                Fault::NameInUse => ArrayError::NameInUse {
                    name: initiator.id.clone(),
                },
                _ => response.into_error(),
            })
        })
    }

    fn map_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, u32> {
        Box::pin(async move {
            let access = json!({
                "hostAccess": [{ "host": { "id": group.id }, "accessMask": ACCESS_PRODUCTION }],
            });
            let response = self.modify_lun(lun, access).await?;
            if !response.is_success() {
                return Err(match fault(&response) {
                    Fault::AlreadyAttached => ArrayError::AlreadyMapped {
                        lun: lun.name.clone(),
                        group: group.name.clone(),
                    },
                    _ => response.into_error(),
                });
            }
            let rows: Vec<UnityHostLun> = self
                .list(
                    "hostLUN",
                    "id,host,lun,hlu",
                    Some(format!("lun.id eq \"{}\"", lun.id)),
                )
                .await?;
            rows.iter()
                .find(|row| row.host.id == group.id)
                .and_then(|row| u32::try_from(row.hlu).ok())
                .ok_or_else(|| ArrayError::unexpected(format!("no host lun row for {}", lun.name)))
        })
    }

    fn unmap_lun<'a>(&'a self, group: &'a HostGroup, lun: &'a Lun) -> ArrayFuture<'a, ()> {
        Box::pin(async move {
            debug!(host = %group.name, lun = %lun.name, "clearing host access");
            self.modify_lun(lun, json!({ "hostAccess": [] }))
                .await?
                .success()
        })
    }

    fn target_portals(&self) -> ArrayFuture<'_, Vec<TargetPortal>> {
        Box::pin(async move {
            let found: Vec<IscsiPortal> = self
                .list("iscsiPortal", "id,ipAddress,iscsiNode", None)
                .await?;
            if found.is_empty() {
                return Ok(Vec::new());
            }
            let nodes: Vec<IscsiNode> = self.list("iscsiNode", "id,name", None).await?;
            Ok(portals(&found, &nodes))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_filter_quotes_the_name() {
        assert_eq!(name_filter("node-a"), "name eq \"node-a\"");
    }
}
