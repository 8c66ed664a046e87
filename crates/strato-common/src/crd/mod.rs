//! Strato CRD types

mod model;

pub use model::{
    Engine, Model, ModelFeature, ModelSpec, ModelStatus, ModelStatusReplicas,
    DEFAULT_SCALE_DOWN_DELAY_SECONDS, DEFAULT_TARGET_IN_FLIGHT,
};
