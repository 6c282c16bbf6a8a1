//! Bus transport support: the client side of the directory service and the
//! service-manager context hosted by `colloquyd`.
//!
//! Endpoints publish themselves under a name; clients look names up and dial
//! the concrete URI behind them. The directory daemon listens on the socket
//! named by `RPCD_SOCKET_LOCATION` and keeps no state beyond its in-memory
//! table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::client::Client;
use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::object::Object;

/// Environment variable naming the directory service socket.
pub const RPCD_SOCKET_ENV: &str = "RPCD_SOCKET_LOCATION";

/// Default directory service socket.
pub const RPCD_SOCKET_LOCATION: &str = "unix:///var/run/rpcd.sock";

/// Interface the service manager exposes on the daemon's root instance.
pub const RPCD_MANAGER_INTERFACE: &str = "com.colloquy.rpcd.ServiceManager";

/// One published endpoint, as reported by `enumerate`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusNode {
    pub address: u32,
    pub name: String,
    pub description: String,
    pub serial: String,
}

/// The directory socket for this process: `$RPCD_SOCKET_LOCATION` or the
/// well-known default.
pub fn socket_location() -> String {
    std::env::var(RPCD_SOCKET_ENV).unwrap_or_else(|_| RPCD_SOCKET_LOCATION.to_owned())
}

async fn manager_call(method: &str, args: Object) -> Result<Object> {
    let client = Client::connect(&socket_location(), None).await?;
    let result = async {
        let call = client
            .connection()
            .call(None, Some(RPCD_MANAGER_INTERFACE), method, args)
            .await?;
        match call.wait().await {
            crate::call::CallStatus::Done => Ok(call.result().unwrap_or_else(Object::null)),
            crate::call::CallStatus::Error => {
                let error = call.result().unwrap_or_else(Object::null);
                Err(error
                    .to_rpc_error()
                    .unwrap_or_else(|_| RpcError::internal("malformed directory error")))
            }
            other => Err(RpcError::internal(format!(
                "unexpected directory call status {:?}",
                other
            ))),
        }
    }
    .await;
    client.close().await;
    result
}

/// Publish `uri` under `name`.
pub async fn register(uri: &str, name: &str, description: Option<&str>) -> Result<()> {
    let args = Object::dict_from([
        ("uri", Object::string(uri)),
        ("name", Object::string(name)),
        (
            "description",
            description.map(Object::string).unwrap_or_else(Object::null),
        ),
    ]);
    manager_call("register", args).await.map(|_| ())
}

/// Withdraw a published name.
pub async fn unregister(name: &str) -> Result<()> {
    let args = Object::dict_from([("name", Object::string(name))]);
    manager_call("unregister", args).await.map(|_| ())
}

/// Resolve a published name to its concrete URI.
pub async fn lookup(name: &str) -> Result<String> {
    let args = Object::dict_from([("name", Object::string(name))]);
    let result = manager_call("lookup", args).await?;
    Ok(result.as_str()?.to_owned())
}

/// Look up `name` and connect to the endpoint behind it.
pub async fn connect_to(name: &str) -> Result<Client> {
    let uri = lookup(name).await?;
    Client::connect(&uri, None).await
}

/// Every node currently published on the bus.
pub async fn enumerate() -> Result<Vec<BusNode>> {
    let result = manager_call("enumerate", Object::array(Vec::new())).await?;
    let mut nodes = Vec::new();
    for entry in result.array_iter()? {
        let entry = entry?;
        nodes.push(BusNode {
            address: entry
                .get_key("address")
                .map(|a| a.as_u64().unwrap_or(0) as u32)
                .unwrap_or(0),
            name: entry
                .get_key("name")
                .and_then(|n| n.as_str().ok().map(str::to_owned))
                .unwrap_or_default(),
            description: entry
                .get_key("description")
                .and_then(|d| d.as_str().ok().map(str::to_owned))
                .unwrap_or_default(),
            serial: entry
                .get_key("serial")
                .and_then(|s| s.as_str().ok().map(str::to_owned))
                .unwrap_or_default(),
        });
    }
    Ok(nodes)
}

/// Lightweight reachability probe of a published node: true when the node
/// answers a ping within the directory's deadline.
pub async fn ping(name: &str) -> Result<bool> {
    let result = manager_call("ping", Object::dict_from([("name", Object::string(name))])).await?;
    Ok(result.as_u64().unwrap_or(0) == 1)
}

struct ServiceEntry {
    uri: String,
    description: String,
    serial: String,
    address: u32,
}

/// Build the service-manager [`Context`] hosted by the directory daemon.
///
/// Methods on [`RPCD_MANAGER_INTERFACE`]: `register`, `unregister`,
/// `lookup`, `enumerate`, `ping`.
pub fn service_manager_context() -> Context {
    let context = Context::new();
    let table: Arc<RwLock<HashMap<String, ServiceEntry>>> = Arc::new(RwLock::new(HashMap::new()));
    let next_address = Arc::new(AtomicU32::new(1));

    {
        let table = table.clone();
        context
            .register_func(None, Some(RPCD_MANAGER_INTERFACE), "register", move |_cx, args| {
                let name = require_str(&args, "name")?;
                let uri = require_str(&args, "uri")?;
                let description = args
                    .get_key("description")
                    .and_then(|d| d.as_str().ok().map(str::to_owned))
                    .unwrap_or_default();

                let address = next_address.fetch_add(1, Ordering::Relaxed);
                let serial = args
                    .get_key("serial")
                    .and_then(|s| s.as_str().ok().map(str::to_owned))
                    .unwrap_or_else(|| format!("{:08x}", address));

                table.write().insert(
                    name,
                    ServiceEntry {
                        uri,
                        description,
                        serial,
                        address,
                    },
                );
                Ok(Object::null())
            })
            .unwrap();
    }

    {
        let table = table.clone();
        context
            .register_func(
                None,
                Some(RPCD_MANAGER_INTERFACE),
                "unregister",
                move |_cx, args| {
                    let name = require_str(&args, "name")?;
                    if table.write().remove(&name).is_none() {
                        return Err(RpcError::not_found(format!(
                            "no service registered as {:?}",
                            name
                        )));
                    }
                    Ok(Object::null())
                },
            )
            .unwrap();
    }

    {
        let table = table.clone();
        context
            .register_func(None, Some(RPCD_MANAGER_INTERFACE), "lookup", move |_cx, args| {
                let name = require_str(&args, "name")?;
                table
                    .read()
                    .get(&name)
                    .map(|entry| Object::string(&entry.uri))
                    .ok_or_else(|| {
                        RpcError::not_found(format!("no service registered as {:?}", name))
                    })
            })
            .unwrap();
    }

    {
        let table = table.clone();
        context
            .register_func(
                None,
                Some(RPCD_MANAGER_INTERFACE),
                "enumerate",
                move |_cx, _args| {
                    let table = table.read();
                    let mut entries: Vec<(&String, &ServiceEntry)> = table.iter().collect();
                    entries.sort_by_key(|(_, entry)| entry.address);
                    Ok(Object::array(
                        entries
                            .iter()
                            .map(|(name, entry)| {
                                Object::dict_from([
                                    ("address", Object::uint64(u64::from(entry.address))),
                                    ("name", Object::string(name.as_str())),
                                    ("description", Object::string(&entry.description)),
                                    ("serial", Object::string(&entry.serial)),
                                ])
                            })
                            .collect(),
                    ))
                },
            )
            .unwrap();
    }

    {
        let table = table.clone();
        context
            .register_async(None, Some(RPCD_MANAGER_INTERFACE), "ping", move |_cx, args| {
                let uri = (|| {
                    let name = require_str(&args, "name")?;
                    table
                        .read()
                        .get(&name)
                        .map(|entry| entry.uri.clone())
                        .ok_or_else(|| {
                            RpcError::not_found(format!("no service registered as {:?}", name))
                        })
                })();
                async move {
                    let uri = uri?;
                    let reachable = match Client::connect(&uri, None).await {
                        Ok(client) => {
                            let alive = client
                                .connection()
                                .ping(Duration::from_secs(2))
                                .await
                                .unwrap_or(false);
                            client.close().await;
                            alive
                        }
                        Err(_) => false,
                    };
                    Ok(Object::uint64(u64::from(reachable)))
                }
            })
            .unwrap();
    }

    context
}

fn require_str(args: &Object, key: &str) -> Result<String> {
    args.get_key(key)
        .and_then(|v| v.as_str().ok().map(str::to_owned))
        .ok_or_else(|| RpcError::invalid_arguments(format!("missing {:?} argument", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;

    // The directory socket location is process-global state; serialize the
    // tests that rewrite it.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    async fn start_directory() -> (Server, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("rpcd.sock");
        let uri = format!("unix://{}", socket.display());

        let server = Server::listen(&uri, service_manager_context()).await.unwrap();
        server.resume();

        // The library reads the socket location from the environment.
        unsafe { std::env::set_var(RPCD_SOCKET_ENV, &uri) };
        (server, dir)
    }

    #[tokio::test]
    async fn register_lookup_enumerate() {
        let _env = ENV_LOCK.lock();
        let (_server, _dir) = start_directory().await;

        register("unix:///tmp/svc-a.sock", "com.example.a", Some("service a"))
            .await
            .unwrap();
        register("unix:///tmp/svc-b.sock", "com.example.b", None)
            .await
            .unwrap();

        assert_eq!(
            lookup("com.example.a").await.unwrap(),
            "unix:///tmp/svc-a.sock"
        );

        let nodes = enumerate().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().any(|n| n.name == "com.example.a"));
        assert!(nodes.iter().all(|n| !n.serial.is_empty()));

        unregister("com.example.a").await.unwrap();
        let err = lookup("com.example.a").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn ping_reports_unreachable_service() {
        let _env = ENV_LOCK.lock();
        let (_server, _dir) = start_directory().await;

        register("unix:///tmp/gone.sock", "com.example.gone", None)
            .await
            .unwrap();
        assert!(!ping("com.example.gone").await.unwrap());
    }
}
