//! Convergence accelerators of the amplitude iteration.

use crate::prelude::*;

/// Turns raw amplitude estimates into the next accelerated estimate.
pub trait Mixer {
    /// Record a new raw `estimate` with its `change` from the previous amplitudes.
    fn append(&mut self, estimate: AmplitudeVector, change: AmplitudeVector) -> Result<()>;

    /// Accelerated estimate; fails before the first `append`.
    fn current(&self) -> Result<AmplitudeVector>;

    /// Number of records currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerKind {
    Linear,
    Diis,
}

impl std::str::FromStr for MixerKind {
    type Err = CcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" | "Linear" | "LinearMixer" => Ok(Self::Linear),
            "diis" | "DIIS" | "Diis" | "DiisMixer" => Ok(Self::Diis),
            _ => Err(CcError::UnknownMixer(s.to_string())),
        }
    }
}

impl MixerKind {
    pub fn build(&self, config: &CcConfig) -> Box<dyn Mixer> {
        match self {
            Self::Linear => Box::new(LinearMixer::new(config.mixing_ratio)),
            Self::Diis => Box::new(DiisMixer::new(config.max_residua)),
        }
    }
}

/* #region linear */

/// `next = ratio * estimate + (1 - ratio) * previous next`.
pub struct LinearMixer {
    ratio: f64,
    last: Option<AmplitudeVector>,
}

impl LinearMixer {
    pub fn new(ratio: f64) -> Self {
        Self { ratio, last: None }
    }
}

impl Mixer for LinearMixer {
    fn append(&mut self, mut estimate: AmplitudeVector, _change: AmplitudeVector) -> Result<()> {
        if let Some(last) = &self.last {
            estimate.scale(self.ratio);
            estimate.add(last, 1.0 - self.ratio)?;
        }
        self.last = Some(estimate);
        Ok(())
    }

    fn current(&self) -> Result<AmplitudeVector> {
        self.last.clone().ok_or(CcError::EmptyMixer)
    }

    fn len(&self) -> usize {
        self.last.iter().count()
    }

    fn clear(&mut self) {
        self.last = None;
    }
}

/* #endregion */

#[cfg(test)]
mod test {
    use super::*;

    fn constant(space: &OrbitalSpace, value: f64) -> AmplitudeVector {
        let mut x = AmplitudeVector::zeros(space, 1, &DeviceTsr::default());
        let shape = space.rank_shape(1);
        *x.get_mut(1).unwrap() = util::tensor_from_vec(vec![value; shape.iter().product()], &shape, &DeviceTsr::default());
        x
    }

    #[test]
    fn test_mixer_kind_parsing() {
        assert_eq!("LinearMixer".parse::<MixerKind>().unwrap(), MixerKind::Linear);
        assert_eq!("diis".parse::<MixerKind>().unwrap(), MixerKind::Diis);
        assert!(matches!("Anderson".parse::<MixerKind>(), Err(CcError::UnknownMixer(name)) if name == "Anderson"));
    }

    #[test]
    fn test_linear_mixer_damping() {
        let space = OrbitalSpace::new(vec![-1.0], vec![0.5, 0.6]);
        let mut mixer = LinearMixer::new(0.25);
        assert!(matches!(mixer.current(), Err(CcError::EmptyMixer)));

        mixer.append(constant(&space, 4.0), constant(&space, 0.0)).unwrap();
        assert_eq!(util::tensor_to_vec(mixer.current().unwrap().get(1).unwrap()), vec![4.0, 4.0]);

        mixer.append(constant(&space, 8.0), constant(&space, 0.0)).unwrap();
        // 0.25 * 8 + 0.75 * 4
        assert_eq!(util::tensor_to_vec(mixer.current().unwrap().get(1).unwrap()), vec![5.0, 5.0]);
        assert_eq!(mixer.len(), 1);

        mixer.clear();
        assert!(mixer.is_empty());
    }

    #[test]
    fn test_build_from_config() {
        let config = CcConfig { mixer: MixerKind::Diis, max_residua: 3, ..Default::default() };
        let mixer = config.mixer.build(&config);
        assert!(mixer.is_empty());
        assert!(matches!(mixer.current(), Err(CcError::EmptyMixer)));
    }
}
