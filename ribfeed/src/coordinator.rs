//
// Copyright (c) The Ribfeed Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use derive_new::new;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::{Instrument, info, info_span};

use crate::bird::Export;
use crate::config::{BirdImportConfig, ModuleConfig};
use crate::error::Error;
use crate::import::{
    ConnHandle, FeedStream, Gateway, ImportTask, RibForwarder, StreamSlot,
};
use crate::proto;
use crate::proto::route_service_client::RouteServiceClient;

// Route-import coordinator: maintains one live import per target and
// serves the module configuration entrypoint.
//
// Clones share the same import registry and quit signal.
#[derive(Clone)]
pub struct ImportCoordinator {
    // gRPC endpoint of the Route service (gateway) for RIB updates.
    gateway_endpoint: String,
    // Active imports, keyed by target.
    imports: Arc<Mutex<BTreeMap<ImportKey, ImportHolder>>>,
    // Signals all import supervisors to stop.
    quit: CancellationToken,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, new)]
struct ImportKey {
    config_name: String,
    dataplane_instance: u32,
}

// Registry entry for one import: the handles needed to supersede it. The
// supervisor owns everything else.
#[derive(Debug, new)]
struct ImportHolder {
    cancel: CancellationToken,
    conn: ConnHandle,
}

// ===== impl ImportCoordinator =====

impl ImportCoordinator {
    pub fn new(gateway_endpoint: String) -> ImportCoordinator {
        ImportCoordinator {
            gateway_endpoint,
            imports: Arc::new(Mutex::new(BTreeMap::new())),
            quit: CancellationToken::new(),
        }
    }

    // Signals all background import loops to stop.
    pub fn shutdown(&self) {
        self.quit.cancel();
    }

    async fn setup(
        &self,
        instance: u32,
        config_name: &str,
        config: ModuleConfig,
    ) -> Result<(), Error> {
        let gateway = Gateway::connect(&self.gateway_endpoint)?;
        let mut client = RouteServiceClient::new(gateway.channel());
        let target = proto::RibTarget {
            config_name: config_name.to_owned(),
            dataplane_instance: instance,
        };

        // Insert and flush static routes first.
        for route in &config.routes {
            let request = proto::InsertRouteRequest {
                target: Some(target.clone()),
                prefix: route.prefix.to_string(),
                nexthop_addr: route.nexthop.to_string(),
            };
            client
                .insert_route(request)
                .await
                .map_err(Error::InsertRoute)?;
        }
        let request = proto::FlushRoutesRequest {
            target: Some(target.clone()),
        };
        client
            .flush_routes(request)
            .await
            .map_err(Error::FlushRoutes)?;

        if config.bird_import.sockets.is_empty() {
            // No background import to run; the gateway connection is
            // dropped here.
            return Ok(());
        }

        // And then stream dynamic routes, if any.
        self.install_import(gateway, client, config.bird_import, target)
            .await
    }

    // Installs a new import for the target, superseding any active import
    // under the same key, and spawns its supervisor.
    async fn install_import(
        &self,
        gateway: Gateway,
        mut client: RouteServiceClient<Channel>,
        config: BirdImportConfig,
        target: proto::RibTarget,
    ) -> Result<(), Error> {
        let stream = FeedStream::open(&mut client)
            .await
            .map_err(Error::StreamOpen)?;

        let cancel = CancellationToken::new();
        let slot = Arc::new(StreamSlot::default());
        slot.replace(stream);

        let forwarder = RibForwarder::new(
            target.clone(),
            client.clone(),
            slot.clone(),
            cancel.clone(),
        );
        let export = Export::new(config, Arc::new(forwarder));
        let task = ImportTask::new(
            export,
            client,
            gateway.clone(),
            slot,
            cancel.clone(),
            self.quit.clone(),
        );
        let holder = ImportHolder::new(cancel, gateway.handle());
        let key = ImportKey::new(target.config_name.clone(), target.dataplane_instance);

        // Only signal work happens under the registry lock; the
        // predecessor's supervisor performs the actual teardown
        // asynchronously.
        {
            let mut imports = self.imports.lock().unwrap();
            if let Some(old) = imports.insert(key, holder) {
                info!("replacing existing BIRD import");
                old.cancel.cancel();
                old.conn.close();
            }
        }

        let span = info_span!(
            "import",
            config = %target.config_name,
            instance = target.dataplane_instance
        );
        tokio::spawn(task.run().instrument(span));

        Ok(())
    }
}

// ===== impl proto::Coordinator =====

#[tonic::async_trait]
impl proto::coordinator_server::Coordinator for ImportCoordinator {
    async fn setup_config(
        &self,
        request: Request<proto::SetupConfigRequest>,
    ) -> Result<Response<proto::SetupConfigResponse>, Status> {
        let request = request.into_inner();
        info!(
            name = %request.config_name,
            instance = request.dataplane_instance,
            "setting up configuration"
        );

        let config: ModuleConfig = serde_yaml::from_slice(&request.config).map_err(|error| {
            Status::invalid_argument(format!("failed to parse configuration: {}", error))
        })?;

        self.setup(request.dataplane_instance, &request.config_name, config)
            .await
            .map_err(|error| {
                Status::internal(format!("failed to set up configuration: {}", error))
            })?;

        Ok(Response::new(proto::SetupConfigResponse {}))
    }
}
