use crate::prelude::*;
use itertools::Itertools;
use std::collections::HashMap;

/// DIIS extrapolation over a bounded history of `(estimate, change)` records.
///
/// The overlap of the changes is kept incrementally in a bordered matrix; when
/// the history is full the oldest record is evicted and its slot reused.
pub struct DiisMixer {
    /// Maximum number of records. Default is 4.
    capacity: usize,

    /// Overlap of the stored changes, allocated with the first record.
    ///
    /// The first row and column are the auxiliary vector `[0, 1, ..., 1]`, so
    /// record slots are 1-based. Slots `1..=len` are always occupied.
    ovlp: Option<Tsr>,

    /// Mapping: slot -> (estimate, change)
    records: HashMap<usize, (AmplitudeVector, AmplitudeVector)>,

    /// Mapping: slot -> insertion count
    inserted: HashMap<usize, usize>,

    /// Number of records appended since the last clear.
    count: usize,
}

impl Default for DiisMixer {
    fn default() -> Self {
        Self::new(4)
    }
}

impl DiisMixer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), ovlp: None, records: HashMap::new(), inserted: HashMap::new(), count: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn newest(&self) -> Option<&(AmplitudeVector, AmplitudeVector)> {
        let (slot, _) = self.inserted.iter().max_by_key(|&(_, n)| n)?;
        self.records.get(slot)
    }

    /// Slot of the next record: the first free one, else the oldest.
    fn head(&self) -> usize {
        match self.records.len() < self.capacity {
            true => self.records.len() + 1,
            false => self.inserted.iter().min_by_key(|&(_, n)| n).map_or(1, |(&slot, _)| slot),
        }
    }

    /// Extrapolation coefficients per slot, or `None` when the DIIS system is
    /// ill-conditioned.
    ///
    /// The overlap block is normalized by its largest diagonal element before
    /// the bordered matrix is diagonalized.
    fn coefficients(&self) -> Option<Vec<f64>> {
        let num_space = self.records.len();
        let dim = num_space + 1;
        let mut ovlp = self.ovlp.as_ref()?.i((..dim, ..dim)).into_contig(RowMajor);

        let scale = ovlp.i((1.., 1..)).diagonal(None).abs().max_all();
        if scale > 0.0 {
            let scaled = &ovlp.i((1.., 1..)) / scale;
            ovlp.i_mut((1.., 1..)).assign(&scaled);
        }

        let (w, v): (Tsr, Tsr) = rt::linalg::eigh(&ovlp).into();

        let w_abs = (&w).abs();
        if w_abs.min_all() < 30.0 * f64::EPSILON * w_abs.max_all() {
            return None;
        }
        let w = w.mapv(|x| 1.0 / x);

        // g: [1, 0, 0, ..., 0]
        let mut g: Tsr = rt::zeros(([dim], ovlp.device()));
        g[[0]] = 1.0;

        let c = (v.view() * w) % v.t().conj() % g;
        let c = (1..dim).map(|slot| c[[slot]]).collect_vec();
        c.iter().all(|x| x.is_finite()).then_some(c)
    }
}

impl Mixer for DiisMixer {
    fn append(&mut self, estimate: AmplitudeVector, change: AmplitudeVector) -> Result<()> {
        estimate.check_compatible(&change)?;
        if let Some((newest, _)) = self.newest() {
            newest.check_compatible(&estimate)?;
        }
        let device = change.get(1)?.device().clone();

        let head = self.head();
        self.records.insert(head, (estimate, change));
        self.inserted.insert(head, self.count);
        self.count += 1;

        let num_space = self.records.len();
        let change = &self.records[&head].1;
        let row = (1..=num_space).map(|slot| self.records[&slot].1.dot(change)).collect::<Result<Vec<f64>>>()?;
        let row = util::tensor_from_vec(row, &[num_space], &device);

        let capacity = self.capacity;
        let ovlp = self.ovlp.get_or_insert_with(|| {
            let mut ovlp = rt::zeros(([capacity + 1, capacity + 1], &device));
            ovlp.i_mut((0, 1..)).fill(1.0);
            ovlp.i_mut((1.., 0)).fill(1.0);
            ovlp
        });
        // a reused slot gets its whole row and column overwritten
        ovlp.i_mut((head, 1..num_space + 1)).assign(&row);
        ovlp.i_mut((1..num_space + 1, head)).assign(&row);
        Ok(())
    }

    fn current(&self) -> Result<AmplitudeVector> {
        let (newest, _) = self.newest().ok_or(CcError::EmptyMixer)?;

        let Some(c) = self.coefficients() else {
            tracing::warn!("DIIS system is ill-conditioned with {} records, using the newest estimate", self.len());
            return Ok(newest.clone());
        };
        tracing::trace!("DIIS coefficients: {c:?}");

        let mut next = newest.zeros_like();
        for (slot, &ci) in (1..).zip(&c) {
            next.add(&self.records[&slot].0, ci)?;
        }
        Ok(next)
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn clear(&mut self) {
        self.records.clear();
        self.inserted.clear();
        self.ovlp = None;
        self.count = 0;
    }
}
