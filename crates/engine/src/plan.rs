//! Output plans
//!
//! A plan names the target canvas, the background treatment and whether
//! subtitles are burned in. Plans come from a [`PlanSource`] once per run and
//! are looked up by id when jobs are built.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Error type for plan and template resolution
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    /// No plan with the requested id in the catalog
    #[error("Plan not found: {0}")]
    PlanNotFound(u32),

    /// The template source returned no command for the selected path
    #[error("No {path} command template for plan {plan_id}")]
    MissingTemplate { plan_id: u32, path: &'static str },
}

/// A named output specification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub blur_bg: bool,
    #[serde(default)]
    pub add_subtitle: bool,
}

/// Where plans come from
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn plans(&self) -> Result<Vec<Plan>, ResolveError>;
}

/// The stock plan catalog
#[derive(Debug, Clone, Default)]
pub struct BuiltinPlans;

#[async_trait]
impl PlanSource for BuiltinPlans {
    async fn plans(&self) -> Result<Vec<Plan>, ResolveError> {
        Ok(builtin_plans())
    }
}

/// Portrait and landscape canvases; plan 6 is the auto-subtitle layout.
pub fn builtin_plans() -> Vec<Plan> {
    fn plan(id: u32, name: &str, description: &str, width: u32, height: u32) -> Plan {
        Plan {
            id,
            name: name.to_string(),
            description: description.to_string(),
            width,
            height,
            blur_bg: false,
            add_subtitle: false,
        }
    }

    vec![
        plan(1, "Plan 1", "Portrait, standard", 1200, 2480),
        plan(2, "Plan 2", "Portrait, tall", 1200, 3000),
        Plan {
            blur_bg: true,
            ..plan(3, "Plan 3", "Portrait, short with blurred background", 1200, 1480)
        },
        plan(4, "Plan 4 landscape", "Landscape, standard", 1200, 1480),
        plan(5, "Plan 5 landscape", "Landscape, large", 1500, 2800),
        Plan {
            add_subtitle: true,
            ..plan(6, "Plan 6 auto subtitles", "Portrait with burned-in subtitles", 720, 1080)
        },
    ]
}

/// Plans resolved for one run, indexed by id
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: HashMap<u32, Arc<Plan>>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self {
            plans: plans.into_iter().map(|p| (p.id, Arc::new(p))).collect(),
        }
    }

    /// Query the source once and index the result
    pub async fn fetch(source: &dyn PlanSource) -> Result<Self, ResolveError> {
        Ok(Self::new(source.plans().await?))
    }

    pub fn find(&self, id: u32) -> Result<Arc<Plan>, ResolveError> {
        self.plans
            .get(&id)
            .cloned()
            .ok_or(ResolveError::PlanNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
