//! Builder for configuring a PeerHost.

use std::sync::Arc;

use tracing::{debug, info};

use crate::codec::{JsonCodec, SerdeJsonCodec};
use crate::config::{Concurrency, PeerHostOptions};
use crate::error::{PeerError, Result};
use crate::pipeline::{InvocationPipeline, PipelineSettings};
use crate::platform::{self, EnvironmentInfo, SystemEnvironment};
use crate::pool::ProcessPool;
use crate::process::{ProcessSpawner, ProcessSupervisor, TokioSpawner};
use crate::transport::{HttpTransport, Transport};
use crate::watcher::FileWatchCoordinator;
use crate::PeerHost;

/// Builder for configuring a [`PeerHost`].
///
/// The defaults spawn real processes and talk HTTP to them. Every seam can be
/// replaced, which is how tests run without a runtime installed.
///
/// # Example
///
/// ```rust,no_run
/// use peerhost::{PeerHost, PeerHostOptions, ProcessOptions};
///
/// let mut options = PeerHostOptions::default();
/// options.process = ProcessOptions::new("peerhost-peer");
///
/// let host = PeerHost::builder(options).build()?;
/// # Ok::<(), peerhost::PeerError>(())
/// ```
pub struct PeerHostBuilder {
    options: PeerHostOptions,
    spawner: Option<Arc<dyn ProcessSpawner>>,
    transport: Option<Arc<dyn Transport>>,
    codec: Option<Arc<dyn JsonCodec>>,
    environment: Option<Arc<dyn EnvironmentInfo>>,
}

impl PeerHostBuilder {
    pub fn new(options: PeerHostOptions) -> Self {
        Self {
            options,
            spawner: None,
            transport: None,
            codec: None,
            environment: None,
        }
    }

    /// Use a custom process spawner.
    ///
    /// Default: [`TokioSpawner`]
    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Use a custom transport, shared by every pipeline.
    ///
    /// Default: [`HttpTransport`] configured from the HTTP options.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom JSON codec.
    ///
    /// Default: [`SerdeJsonCodec`]
    pub fn with_codec(mut self, codec: Arc<dyn JsonCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Use custom host information for pool sizing.
    ///
    /// Default: [`SystemEnvironment`]
    pub fn with_environment(mut self, environment: Arc<dyn EnvironmentInfo>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Number of peers the built host will run.
    pub fn pool_size(&self) -> usize {
        match self.options.service.concurrency {
            Concurrency::None => 1,
            Concurrency::MultiProcess if self.options.service.concurrency_degree > 0 => {
                self.options.service.concurrency_degree as usize
            }
            Concurrency::MultiProcess => {
                let environment = self
                    .environment
                    .clone()
                    .unwrap_or_else(|| Arc::new(SystemEnvironment) as Arc<dyn EnvironmentInfo>);
                environment.processor_count().max(1)
            }
        }
    }

    /// Build the host. No process is started until the first invocation.
    pub fn build(self) -> Result<PeerHost> {
        if self.options.process.executable_path.trim().is_empty() {
            return Err(PeerError::argument(
                "process.executable_path",
                "must name the peer executable",
            ));
        }

        let transport: Arc<dyn Transport> = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(HttpTransport::new(&self.options.http)?),
        };
        let codec: Arc<dyn JsonCodec> = match &self.codec {
            Some(codec) => Arc::clone(codec),
            None => Arc::new(SerdeJsonCodec),
        };
        let spawner: Arc<dyn ProcessSpawner> = match &self.spawner {
            Some(spawner) => Arc::clone(spawner),
            None => Arc::new(TokioSpawner),
        };

        debug!(
            "Building peer host on {} for `{}`",
            platform::current_platform(),
            self.options.process.executable_path
        );

        match self.options.service.concurrency {
            Concurrency::None => {
                let pipeline = self.build_pipeline(&transport, &codec, &spawner)?;
                Ok(PeerHost::Single(pipeline))
            }
            Concurrency::MultiProcess => {
                let size = self.pool_size();
                let pipelines = (0..size)
                    .map(|_| self.build_pipeline(&transport, &codec, &spawner))
                    .collect::<Result<Vec<_>>>()?;
                info!("Configured a pool of {} peers", size);
                Ok(PeerHost::Pool(ProcessPool::new(pipelines)?))
            }
        }
    }

    fn build_pipeline(
        &self,
        transport: &Arc<dyn Transport>,
        codec: &Arc<dyn JsonCodec>,
        spawner: &Arc<dyn ProcessSpawner>,
    ) -> Result<InvocationPipeline> {
        let service = &self.options.service;
        let supervisor =
            ProcessSupervisor::new(self.options.process.clone(), service.connection_timeout())
                .with_spawner(Arc::clone(spawner));

        let watcher = if service.enable_file_watching {
            let root = self.options.watch_root().ok_or_else(|| PeerError::Config {
                message: "file watching is enabled but there is no directory to watch".to_string(),
            })?;
            Some(FileWatchCoordinator::new(
                root,
                service.watch_subdirectories,
                &service.watch_file_name_patterns,
                service.watch_debounce(),
            )?)
        } else {
            None
        };

        Ok(InvocationPipeline::new(
            Arc::new(supervisor),
            Arc::clone(transport),
            Arc::clone(codec),
            PipelineSettings {
                invocation_timeout: service.invocation_timeout(),
                graceful_shutdown: service.graceful_process_shutdown,
                watcher,
            },
        ))
    }
}
