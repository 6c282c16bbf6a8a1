//! Client: dials an endpoint and owns the resulting [`Connection`].

use crate::bus;
use crate::connection::Connection;
use crate::error::Result;
use crate::object::Object;
use crate::transport::{Scheme, Transport, Uri};

/// A connected RPC client.
pub struct Client {
    connection: Connection,
    uri: String,
}

impl Client {
    /// Dial `uri`. `params` may be `None` for defaults or a dictionary with
    /// transport-specific options; a `serializer` entry overrides the wire
    /// codec. A `bus://<name>` URI is resolved through the directory service
    /// first.
    pub async fn connect(uri: &str, params: Option<Object>) -> Result<Client> {
        let parsed = Uri::parse(uri)?;
        let resolved = if parsed.scheme() == Scheme::Bus {
            Uri::parse(&Box::pin(bus::lookup(parsed.bus_name())).await?)?
        } else {
            parsed
        };

        let serializer = params
            .as_ref()
            .and_then(|p| p.get_key("serializer"))
            .and_then(|s| s.as_str().ok().map(str::to_owned));

        let transport = Transport::connect(&resolved, params.as_ref()).await?;
        let connection = Connection::new(transport, None, serializer.as_deref())?;

        Ok(Client {
            connection,
            uri: uri.to_owned(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The URI this client was asked to dial (before bus resolution).
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}
