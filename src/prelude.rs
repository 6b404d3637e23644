#![allow(unused)]

/* #region for API callers */

pub use crate::amplitudes::{AmplitudeVector, Denominators};
pub use crate::ccsd::{AmplitudeEquations, Ccsd};
pub use crate::contraction::{ContractionEngine, DenseContraction};
pub use crate::error::{CcError, Result};
pub use crate::hbar::SimilarityTransformedHamiltonian;
pub use crate::integrals::{CoulombVertex, IntegralBlocks, IntegralProducer, NpyIntegrals, Signature, Space, VertexIntegrals};
pub use crate::intermediates::IntermediateCache;
pub use crate::iteration::IterationEngine;
pub use crate::diis::DiisMixer;
pub use crate::mixer::{LinearMixer, Mixer, MixerKind};
pub use crate::structs::{CcConfig, CcResults, ConvergenceStatus, EvaluationMode, FockBlocks, OrbitalSpace};

/* #endregion */

/* #region for developers */

pub type DeviceTsr = DeviceFaer;

pub(crate) use rayon::prelude::*;
pub(crate) use rstsr::prelude::*;

pub(crate) use crate::*;

pub type Tsr<D = IxD> = Tensor<f64, DeviceTsr, D>;
pub type TsrView<'a, D = IxD> = TensorView<'a, f64, DeviceTsr, D>;

/* #endregion */
