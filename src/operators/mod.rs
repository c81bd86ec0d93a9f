//! Operator interface and the operator-to-plan translation
//!
//! An operator is a pure mapping from sample to sample. Operators that can
//! be accelerated describe themselves to a [`PlanBuilder`]; the first one
//! that cannot forces it and everything after it onto the generic mapper
//! path. Plan execution is an external concern behind [`PlanExecutor`].

mod plan;

pub use plan::{
    DecodeMode, FlipCode, Interpolation, LuaSource, Plan, PlanBuilder, PlanStep, RandomCropSpec,
    Rotation,
};

use std::sync::Arc;

use bytes::Bytes;

use crate::pipeline::{RecordMapper, WorkerMode, XmapConfig};
use crate::types::error::PipelineError;
use crate::types::{Result, Sample};

/// Marker returned by operators that have no accelerated plan.
#[derive(Debug, Clone, Copy)]
pub struct PlanUnsupported;

/// A user-defined transformation of one sample.
pub trait Operator: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Apply the transformation.
    fn apply(&self, sample: Sample) -> Result<Sample>;

    /// Describe this operator to an accelerated-plan builder.
    ///
    /// The default declines, which routes this operator and all following
    /// ones through the generic mapper path.
    fn plan(&self, _builder: &mut PlanBuilder) -> std::result::Result<(), PlanUnsupported> {
        Err(PlanUnsupported)
    }
}

/// Executes an opaque plan against a payload; implemented outside the core.
pub trait PlanExecutor: Send + Sync {
    /// Run `plan` over `payload`, returning the transformed payload.
    fn execute(&self, plan: &Plan, payload: Bytes) -> Result<Bytes>;
}

/// Chain a list of operators into one record mapper.
pub fn build_mapper(ops: Vec<Arc<dyn Operator>>) -> Result<RecordMapper> {
    if ops.is_empty() {
        return Err(PipelineError::InvalidArgument(
            "cannot build a mapper from an empty operator list".into(),
        )
        .into());
    }
    Ok(Arc::new(move |mut sample| {
        for op in &ops {
            sample = op.apply(sample)?;
        }
        Ok(sample)
    }))
}

/// An operator chain split at the first operator without a plan.
pub struct CompiledOps {
    /// Accelerated prefix, possibly empty.
    pub plan: Plan,
    /// Generic mapper over the remaining operators, when any exist.
    pub post_mapper: Option<RecordMapper>,
}

/// Translate `ops` into a plan prefix plus a generic mapper suffix.
pub fn compile_plan(ops: &[Arc<dyn Operator>]) -> Result<CompiledOps> {
    let mut builder = PlanBuilder::new();
    let mut split = ops.len();
    for (i, op) in ops.iter().enumerate() {
        if op.plan(&mut builder).is_err() {
            tracing::debug!(
                "operator {} has no accelerated plan, {} operators fall back to the mapper path",
                op.name(),
                ops.len() - i
            );
            split = i;
            break;
        }
    }
    let post_mapper = if split < ops.len() {
        Some(build_mapper(ops[split..].to_vec())?)
    } else {
        None
    };
    Ok(CompiledOps {
        plan: builder.build(),
        post_mapper,
    })
}

/// Sizing knobs for [`build_concurrent`].
#[derive(Clone, Copy, Debug)]
pub struct ConcurrencySettings {
    /// Workers applying the operators.
    pub worker_count: usize,
    /// Bound on in-flight samples.
    pub buffer_size: usize,
    /// Worker execution mode.
    pub mode: WorkerMode,
    /// Yield results in input order.
    pub preserve_order: bool,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().clamp(1, crate::constants::DEFAULT_XMAP_WORKERS),
            buffer_size: crate::constants::DEFAULT_XMAP_BUFFER,
            mode: WorkerMode::InProcess,
            preserve_order: false,
        }
    }
}

/// Build a concurrent map stage from an operator list.
///
/// With an executor, the accelerated prefix runs through it and the
/// remaining operators through the generic mapper; without one, the whole
/// chain runs as a generic mapper.
pub fn build_concurrent(
    ops: Vec<Arc<dyn Operator>>,
    executor: Option<Arc<dyn PlanExecutor>>,
    settings: ConcurrencySettings,
) -> Result<XmapConfig> {
    let mapper: RecordMapper = match executor {
        Some(executor) => {
            let compiled = compile_plan(&ops)?;
            if compiled.plan.is_empty() {
                build_mapper(ops)?
            } else {
                let plan = compiled.plan;
                let post = compiled.post_mapper;
                Arc::new(move |sample: Sample| {
                    let payload = executor.execute(&plan, sample.payload)?;
                    let mapped = Sample::new(payload, sample.tags);
                    match &post {
                        Some(post) => post(mapped),
                        None => Ok(mapped),
                    }
                })
            }
        }
        None => build_mapper(ops)?,
    };

    Ok(XmapConfig::new(mapper)
        .workers(settings.worker_count)
        .buffer(settings.buffer_size)
        .mode(settings.mode)
        .ordered(settings.preserve_order))
}
