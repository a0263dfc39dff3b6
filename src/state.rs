//! The shared application context threaded through every handler, replacing
//! the implicit global singletons (store, fabric client, signing key) the
//! source relied on (spec.md §9) with one typed value handed to Axum's
//! `State` extractor.

use std::sync::Arc;

use crate::auth::AuthService;
use crate::chain::SolanaProvider;
use crate::config::Config;
use crate::credit::CreditService;
use crate::artifact::ArtifactGate;
use crate::dispatcher::Dispatcher;
use crate::job_store::JobStore;
use crate::unlock::UnlockCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub job_store: Arc<dyn JobStore>,
    pub chain: Arc<SolanaProvider>,
    pub auth: Arc<AuthService>,
    pub credit: Arc<CreditService>,
    pub artifact: Arc<ArtifactGate>,
    pub unlock: Arc<UnlockCoordinator>,
    pub dispatcher: Arc<Dispatcher>,
}
