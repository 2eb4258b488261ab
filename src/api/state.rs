use std::sync::Arc;

use crate::budget::BudgetLedger;
use crate::manage::ManagementService;

#[derive(Clone)]
pub struct AppState {
    pub manage: ManagementService,
    /// Absent when the API runs without a daemon (e.g. in tests).
    pub budget: Option<Arc<BudgetLedger>>,
}
