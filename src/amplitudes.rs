//! Amplitude vectors and their orbital-energy denominators.

use crate::prelude::*;

/* #region amplitude vector */

/// One element of the iteration's vector space: a rank block per excitation
/// rank `k = 1..K`, each shaped `[Nv; k] ++ [No; k]`.
///
/// All binary operations touch every rank block and reject operands whose
/// shapes differ.
#[derive(Debug, Clone)]
pub struct AmplitudeVector {
    blocks: Vec<Tsr>,
}

impl AmplitudeVector {
    pub fn zeros(space: &OrbitalSpace, max_rank: usize, device: &DeviceTsr) -> Self {
        let blocks = (1..=max_rank)
            .map(|rank| rt::zeros((space.rank_shape(rank), device)))
            .collect();
        Self { blocks }
    }

    /// Wrap existing blocks, checking the rank-block shape convention.
    pub fn from_blocks(blocks: Vec<Tsr>) -> Result<Self> {
        let first = blocks.first().ok_or_else(|| CcError::InvalidConfig("amplitude vector without blocks".into()))?;
        let (nvir, nocc) = match first.shape().as_slice() {
            [nvir, .., nocc] => (*nvir, *nocc),
            _ => return Err(CcError::InvalidConfig(format!("rank 1 block of shape {:?}", first.shape()))),
        };
        let space = OrbitalSpace::new(vec![0.0; nocc], vec![0.0; nvir]);
        for (k, block) in blocks.iter().enumerate() {
            util::check_shape(&format!("rank {} block", k + 1), block, &space.rank_shape(k + 1))?;
        }
        Ok(Self { blocks })
    }

    pub fn zeros_like(&self) -> Self {
        Self { blocks: self.blocks.iter().map(|b| b.zeros_like()).collect() }
    }

    pub fn max_rank(&self) -> usize {
        self.blocks.len()
    }

    /// Block of excitation rank `rank` (1-based).
    pub fn get(&self, rank: usize) -> Result<&Tsr> {
        self.blocks.get(rank.wrapping_sub(1)).ok_or_else(|| self.missing_rank(rank))
    }

    pub(crate) fn get_mut(&mut self, rank: usize) -> Result<&mut Tsr> {
        let err = self.missing_rank(rank);
        self.blocks.get_mut(rank.wrapping_sub(1)).ok_or(err)
    }

    pub fn blocks(&self) -> &[Tsr] {
        &self.blocks
    }

    fn missing_rank(&self, rank: usize) -> CcError {
        CcError::InvalidConfig(format!("rank {rank} requested from an amplitude vector of maximum rank {}", self.max_rank()))
    }

    pub fn check_compatible(&self, other: &Self) -> Result<()> {
        if self.max_rank() != other.max_rank() {
            return Err(CcError::shape_mismatch("number of rank blocks", &[self.max_rank()], &[other.max_rank()]));
        }
        for (k, (a, b)) in self.blocks.iter().zip(&other.blocks).enumerate() {
            util::check_shape(&format!("rank {} block", k + 1), b, a.shape())?;
        }
        Ok(())
    }

    /// `self += scale * other`
    pub fn add(&mut self, other: &Self, scale: f64) -> Result<()> {
        self.check_compatible(other)?;
        for (a, b) in self.blocks.iter_mut().zip(&other.blocks) {
            *a += scale * b;
        }
        Ok(())
    }

    /// `self - other` as a new vector.
    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.check_compatible(other)?;
        Ok(Self { blocks: self.blocks.iter().zip(&other.blocks).map(|(a, b)| a - b).collect() })
    }

    pub fn scale(&mut self, c: f64) {
        for block in self.blocks.iter_mut() {
            *block = c * &*block;
        }
    }

    pub fn dot(&self, other: &Self) -> Result<f64> {
        self.check_compatible(other)?;
        Ok(self.blocks.iter().zip(&other.blocks).map(|(a, b)| (a * b).sum_all()).sum())
    }

    pub fn norm_squared(&self) -> f64 {
        self.blocks.iter().map(|b| (b * b).sum_all()).sum()
    }

    /// Elementwise product.
    pub fn hadamard(&self, other: &Self) -> Result<Self> {
        self.check_compatible(other)?;
        Ok(Self { blocks: self.blocks.iter().zip(&other.blocks).map(|(a, b)| a * b).collect() })
    }

    /// Antisymmetrize the doubles block in place, `Π x = ¼ (x - x_baij - x_abji + x_baji)`.
    pub(crate) fn antisymmetrize_doubles(&mut self, engine: &dyn ContractionEngine) -> Result<()> {
        if let Some(t2) = self.blocks.get_mut(1) {
            *t2 = antisymmetrize_abij(engine, t2)?;
        }
        Ok(())
    }
}

/// Project a doubles-shaped tensor onto its antisymmetric part.
pub(crate) fn antisymmetrize_abij(engine: &dyn ContractionEngine, x: &Tsr) -> Result<Tsr> {
    let mut out = engine.sum_new("abij", x, "abij", 0.25)?;
    engine.sum(&mut out, "abij", x, "baij", -0.25, true)?;
    engine.sum(&mut out, "abij", x, "abji", -0.25, true)?;
    engine.sum(&mut out, "abij", x, "baji", 0.25, true)?;
    Ok(out)
}

/* #endregion */

/* #region denominators */

/// Shifted orbital-energy differences `Σ eps_vir - Σ eps_occ + shift` per rank block.
pub struct Denominators {
    blocks: AmplitudeVector,
}

impl Denominators {
    pub fn new(space: &OrbitalSpace, max_rank: usize, shift: f64, device: &DeviceTsr) -> Self {
        let blocks = (1..=max_rank)
            .map(|rank| {
                let shape = space.rank_shape(rank);
                let mut d: Tsr = rt::zeros((shape.clone(), device));
                d.fill(shift);
                // one broadcast orbital-energy vector per axis
                for axis in 0..2 * rank {
                    let mut bshape = vec![1; 2 * rank];
                    bshape[axis] = shape[axis];
                    let eps = match axis < rank {
                        true => space.eps_vir.clone(),
                        false => space.eps_occ.iter().map(|e| -e).collect(),
                    };
                    d = &d + &util::tensor_from_vec(eps, &bshape, device);
                }
                d
            })
            .collect();
        Self { blocks: AmplitudeVector { blocks } }
    }

    pub fn as_amplitudes(&self) -> &AmplitudeVector {
        &self.blocks
    }

    /// Jacobi step `r = -r / (D + s)`, elementwise per rank block.
    pub fn precondition(&self, residual: &mut AmplitudeVector) -> Result<()> {
        self.blocks.check_compatible(residual)?;
        for (r, d) in residual.blocks.iter_mut().zip(&self.blocks.blocks) {
            *r = -1.0_f64 * (&*r / d);
        }
        Ok(())
    }
}

/* #endregion */

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::random_amplitudes;

    fn toy_space() -> OrbitalSpace {
        OrbitalSpace::new(vec![-1.0, -0.9], vec![0.5, 0.6, 0.7])
    }

    #[test]
    fn test_vector_space_operations() {
        let device = DeviceTsr::default();
        let space = toy_space();
        let x = random_amplitudes(&space, 2, 11, &device);
        let y = random_amplitudes(&space, 2, 12, &device);

        let mut z = x.clone();
        z.add(&y, 2.0).unwrap();
        z.scale(0.5);
        let lhs = z.dot(&x).unwrap();
        let rhs = 0.5 * x.norm_squared() + y.dot(&x).unwrap();
        assert!((lhs - rhs).abs() < 1e-12);

        let d = z.sub(&z).unwrap();
        assert_eq!(d.norm_squared(), 0.0);
        assert_eq!(x.zeros_like().norm_squared(), 0.0);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let device = DeviceTsr::default();
        let x = AmplitudeVector::zeros(&toy_space(), 2, &device);
        let y = AmplitudeVector::zeros(&OrbitalSpace::new(vec![-1.0], vec![0.5, 0.6, 0.7]), 2, &device);
        let singles = AmplitudeVector::zeros(&toy_space(), 1, &device);
        let mut x2 = x.clone();
        assert!(matches!(x2.add(&y, 1.0), Err(CcError::ShapeMismatch { .. })));
        assert!(matches!(x.dot(&singles), Err(CcError::ShapeMismatch { .. })));
        assert!(x.get(3).is_err());
        assert!(x.get(0).is_err());
    }

    #[test]
    fn test_from_blocks_rejects_scalar_and_misshapen_blocks() {
        let device = DeviceTsr::default();
        let scalar = util::tensor_from_vec(vec![1.0], &[], &device);
        assert!(matches!(AmplitudeVector::from_blocks(vec![scalar]), Err(CcError::InvalidConfig(_))));
        assert!(matches!(AmplitudeVector::from_blocks(vec![]), Err(CcError::InvalidConfig(_))));

        let t1 = util::tensor_from_vec(vec![0.0; 6], &[3, 2], &device);
        let t2 = util::tensor_from_vec(vec![0.0; 36], &[3, 3, 2, 2], &device);
        assert_eq!(AmplitudeVector::from_blocks(vec![t1.clone(), t2]).unwrap().max_rank(), 2);
        let wrong = util::tensor_from_vec(vec![0.0; 36], &[2, 2, 3, 3], &device);
        assert!(matches!(AmplitudeVector::from_blocks(vec![t1, wrong]), Err(CcError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_denominators_and_precondition() {
        let device = DeviceTsr::default();
        let space = toy_space();
        let denom = Denominators::new(&space, 2, 0.1, &device);
        let d2 = denom.as_amplitudes().get(2).unwrap();
        // [a=2, b=0, i=1, j=0] -> 0.7 + 0.5 + 0.9 + 1.0 + 0.1
        assert!((d2[[2, 0, 1, 0]] - 3.2).abs() < 1e-12);

        let d3 = Denominators::new(&space, 3, 0.0, &device);
        let d3 = d3.as_amplitudes().get(3).unwrap();
        assert_eq!(d3.shape().as_slice(), &[3, 3, 3, 2, 2, 2]);
        // [a=1, b=2, c=0, i=0, j=1, k=1] -> 0.6 + 0.7 + 0.5 + 1.0 + 0.9 + 0.9
        assert!((d3[[1, 2, 0, 0, 1, 1]] - 4.6).abs() < 1e-12);

        let mut r = AmplitudeVector::zeros(&space, 2, &device);
        *r.get_mut(1).unwrap() = util::tensor_from_vec(vec![1.0; 6], &[3, 2], &device);
        denom.precondition(&mut r).unwrap();
        let r1 = util::tensor_to_vec(r.get(1).unwrap());
        // [a=0, i=0] -> -1 / (0.5 + 1.0 + 0.1)
        assert!((r1[0] + 1.0 / 1.6).abs() < 1e-12);
    }
}
