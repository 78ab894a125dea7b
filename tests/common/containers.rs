// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Mongo and Redis.
//!
//! The oplog only exists on replica-set members, so the Mongo container
//! runs `mongod --replSet rs0` and [`TestMongo::new`] initiates a
//! single-node set before handing the URL out. All client URLs use
//! `directConnection=true`; the member advertises its in-container
//! hostname, which is not routable from the host.

use mongodb::bson::doc;
use std::time::Duration;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage, RunnableImage};

/// Create a vanilla Redis container.
///
/// Uses the official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis container with its URL.
pub struct TestRedis<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
}

impl<'a> TestRedis<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let url = redis_url(&container);
        Self { container, url }
    }

    pub async fn connection(&self) -> redis::aio::ConnectionManager {
        let client = redis::Client::open(self.url.as_str()).expect("redis url");
        client
            .get_connection_manager()
            .await
            .expect("redis connection")
    }
}

/// A single-node Mongo replica set.
pub struct TestMongo<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
}

impl<'a> TestMongo<'a> {
    /// Start `mongod --replSet rs0`, initiate the set, and wait for a
    /// writable primary.
    pub async fn new(docker: &'a Cli) -> Self {
        let image = GenericImage::new("mongo", "7")
            .with_exposed_port(27017)
            .with_wait_for(WaitFor::message_on_stdout("Waiting for connections"));
        let runnable = RunnableImage::from((
            image,
            vec!["--replSet".to_string(), "rs0".to_string()],
        ));
        let container = docker.run(runnable);

        let port = container.get_host_port_ipv4(27017);
        let url = format!("mongodb://127.0.0.1:{}/?directConnection=true", port);

        let mongo = TestMongo { container, url };
        mongo.init_replica_set().await;
        mongo
    }

    pub async fn client(&self) -> mongodb::Client {
        mongodb::Client::with_uri_str(&self.url)
            .await
            .expect("mongo client")
    }

    async fn init_replica_set(&self) {
        let client = self.client().await;
        let admin = client.database("admin");

        // replSetInitiate with the default config; the member advertises
        // its container hostname, which is fine under directConnection.
        let initiated = admin
            .run_command(doc! {"replSetInitiate": {}}, None)
            .await;
        if let Err(e) = initiated {
            // AlreadyInitialized shows up when a test reuses a container.
            let message = e.to_string();
            assert!(
                message.contains("already initialized") || message.contains("AlreadyInitialized"),
                "replSetInitiate failed: {}",
                message
            );
        }

        // Wait for the node to step up to primary.
        for _ in 0..60 {
            if let Ok(hello) = admin.run_command(doc! {"hello": 1}, None).await {
                if hello.get_bool("isWritablePrimary").unwrap_or(false) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("Mongo replica set did not elect a primary in time");
    }
}
