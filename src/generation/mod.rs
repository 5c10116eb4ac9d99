//! Turning logits into tokens: sampling policy, stateful strategies and
//! classifier-free guidance.

pub mod beam;
pub mod guidance;
pub mod mirostat;
pub mod sampling;

pub use beam::{BeamState, BeamStep, Hypothesis};
pub use guidance::{fuse, fuse_output, CfgGuidance};
pub use mirostat::{sample_mirostat, MirostatState};
pub use sampling::{sample, sample_row, Sampled, SamplingContext, SamplingPolicy, Strategy};
