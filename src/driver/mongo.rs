//! Production driver backed by the `mongodb` crate.
//!
//! Each tenant database gets its own `Client`, so evicting one database
//! tears down its sockets without disturbing any other tenant.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use tokio::sync::Mutex;
use tracing::debug;

use super::{ConnState, Connection, Connector, DriverError};

#[derive(Debug, Clone, Default)]
pub struct MongoConnector;

impl MongoConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for MongoConnector {
    type Conn = MongoConnection;

    async fn connect(&self, base_uri: &str, db_name: &str) -> Result<MongoConnection, DriverError> {
        let uri = format!("{base_uri}/{db_name}");
        let options = ClientOptions::parse(&uri).await?;
        let client = Client::with_options(options)?;

        let database = client.database(db_name);
        // Readiness check; fails fast instead of deferring to the first query.
        database.run_command(doc! { "ping": 1 }).await?;

        debug!(db = %db_name, "mongodb connection established");
        Ok(MongoConnection {
            db_name: db_name.to_string(),
            database,
            client: Mutex::new(Some(client)),
            connected: AtomicBool::new(true),
        })
    }
}

pub struct MongoConnection {
    db_name: String,
    database: Database,
    client: Mutex<Option<Client>>,
    connected: AtomicBool,
}

impl MongoConnection {
    /// Handle for issuing queries against this connection's database.
    pub fn database(&self) -> &Database {
        &self.database
    }
}

#[async_trait]
impl Connection for MongoConnection {
    fn db_name(&self) -> &str {
        &self.db_name
    }

    fn state(&self) -> ConnState {
        if self.connected.load(Ordering::Acquire) {
            ConnState::Connected
        } else {
            ConnState::Disconnected
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.connected.store(false, Ordering::Release);
        if let Some(client) = self.client.lock().await.take() {
            client.shutdown().await;
            debug!(db = %self.db_name, "mongodb connection shut down");
        }
        Ok(())
    }
}
