use async_trait::async_trait;
use common::{
    errors::ProcessorError,
    runtime::Runtime,
    LogEvent,
};
use rand::Rng;

use super::{
    Processor,
    ProcessorOutcome,
};

/// Probabilistic pass-through: a uniform draw at or above the rate drops the
/// event. Rate 1 passes everything, rate 0 drops everything.
pub struct SamplerProcessor<RT: Runtime> {
    rt: RT,
    rate: f64,
}

impl<RT: Runtime> SamplerProcessor<RT> {
    pub fn new(rt: RT, rate: f64) -> Result<Self, ProcessorError> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ProcessorError::configuration(
                "sampler_processor",
                format!("rate {rate} must be in [0, 1]"),
            ));
        }
        Ok(Self { rt, rate })
    }
}

#[async_trait]
impl<RT: Runtime> Processor for SamplerProcessor<RT> {
    fn name(&self) -> &'static str {
        "sampler_processor"
    }

    async fn process(&self, _event: &mut LogEvent) -> Result<ProcessorOutcome, ProcessorError> {
        if self.rate >= 1.0 {
            return Ok(ProcessorOutcome::Continue);
        }
        let draw = self.rt.with_rng(|rng| rng.random::<f64>());
        if draw >= self.rate {
            return Ok(ProcessorOutcome::Drop);
        }
        Ok(ProcessorOutcome::Continue)
    }
}
