//! Wiring: opens the stores under the data directory and builds the worker.

use std::sync::Arc;

use anyhow::{Context, Result};
use coordination::debate::{
    DebateJobHandler, DebateOrchestrator, FileSessionStore, KnowledgeCatalog,
    MemoryKnowledgeCatalog, ProviderRouter, SessionStore,
};
use coordination::events::{RunNotifier, SharedRunNotifier};
use coordination::ledger::Ledger;
use coordination::queue::{FileJobQueue, SharedJobQueue};
use coordination::scheduler::Scheduler;
use coordination::worker::{HandlerRegistry, Worker};
use tracing::info;

use crate::config::WorkerConfig;
use crate::knowledge::load_catalog;
use crate::providers::{AgentClient, ChatCompletionClient};

/// Stores shared by every command.
pub struct App {
    pub config: WorkerConfig,
    pub queue: SharedJobQueue,
    pub ledger: Ledger,
    pub sessions: Arc<dyn SessionStore>,
    pub notifier: SharedRunNotifier,
}

impl App {
    pub fn open(config: WorkerConfig) -> Result<Self> {
        let data_dir = &config.data_dir;
        let queue: SharedJobQueue = Arc::new(
            FileJobQueue::open(data_dir)
                .context(format!("Failed to open job queue in {}", data_dir.display()))?,
        );
        let ledger = Ledger::open(data_dir)
            .context(format!("Failed to open run ledger in {}", data_dir.display()))?;
        let sessions: Arc<dyn SessionStore> = Arc::new(
            FileSessionStore::open(data_dir)
                .context(format!("Failed to open session store in {}", data_dir.display()))?,
        );
        info!(data_dir = %data_dir.display(), "Stores opened");

        Ok(Self {
            config,
            queue,
            ledger,
            sessions,
            notifier: RunNotifier::new().shared(),
        })
    }

    fn turn_completion(&self) -> Result<ProviderRouter> {
        let completion = &self.config.completion;
        let direct = ChatCompletionClient::new(
            completion.url.clone(),
            completion.api_key.clone(),
            completion.model.clone(),
            self.config.http_timeout(),
        )
        .context("Failed to build chat completion client")?;

        let mut router = ProviderRouter::new(Arc::new(direct));
        if let Some(agent) = &self.config.agent {
            let client = AgentClient::new(
                agent.url.clone(),
                agent.api_key.clone(),
                self.config.http_timeout(),
            )
            .context("Failed to build agent client")?;
            router = router.with_agent(Arc::new(client));
        }
        Ok(router)
    }

    fn knowledge(&self) -> Result<Arc<dyn KnowledgeCatalog>> {
        Ok(match &self.config.knowledge_path {
            Some(path) => Arc::new(load_catalog(path)?),
            None => Arc::new(MemoryKnowledgeCatalog::new()),
        })
    }

    /// Handlers for every job type this process serves.
    pub fn handlers(&self) -> Result<HandlerRegistry> {
        let orchestrator = DebateOrchestrator::new(
            self.sessions.clone(),
            Arc::new(self.turn_completion()?),
            self.knowledge()?,
        )
        .with_event_log(self.ledger.events.clone());

        Ok(HandlerRegistry::new().register(Arc::new(DebateJobHandler::new(Arc::new(orchestrator)))))
    }

    pub fn worker(&self) -> Result<Worker> {
        Ok(Worker::new(
            self.queue.clone(),
            self.ledger.clone(),
            self.handlers()?,
            self.notifier.clone(),
            self.config.worker_options(),
        ))
    }

    pub fn scheduler(&self) -> Result<Scheduler> {
        Scheduler::new(self.queue.clone(), self.config.triggers.clone())
            .context("Invalid trigger configuration")
    }
}
