use crate::prelude::*;
use itertools::Itertools;
use npyz::WriterBuilder;
use std::ops::Range;
use std::path::{Path, PathBuf};

/* #region tensor helpers */

/// Build a row-major tensor from flat data.
pub fn tensor_from_vec(data: Vec<f64>, shape: &[usize], device: &DeviceTsr) -> Tsr {
    rt::asarray((data, shape.to_vec().c(), device))
}

/// Flatten a tensor to row-major data, whatever its memory layout.
pub fn tensor_to_vec(tsr: &Tsr) -> Vec<f64> {
    tsr.reshape(-1).to_vec()
}

pub fn check_shape(context: &str, tsr: &Tsr, expected: &[usize]) -> Result<()> {
    if tsr.shape().as_slice() == expected {
        Ok(())
    } else {
        Err(CcError::shape_mismatch(context, expected, tsr.shape()))
    }
}

/// Maximum absolute elementwise difference of two tensors of equal shape.
pub fn max_abs_diff(a: &Tsr, b: &Tsr) -> Result<f64> {
    check_shape("max_abs_diff", b, a.shape())?;
    if a.size() == 0 {
        return Ok(0.0);
    }
    Ok((a - b).abs().max_all())
}

fn check_ranges(context: &str, shape: &[usize], ranges: &[Range<usize>]) -> Result<()> {
    let ends = ranges.iter().map(|r| r.end).collect::<Vec<usize>>();
    if ranges.len() != shape.len() || ranges.iter().zip(shape).any(|(r, &n)| r.start > r.end || r.end > n) {
        return Err(CcError::shape_mismatch(context, shape, &ends));
    }
    Ok(())
}

/// Copy out the sub-block `ranges` of a tensor.
pub fn slice_block(tsr: &Tsr, ranges: &[Range<usize>]) -> Result<Tsr> {
    check_ranges("slice_block", tsr.shape(), ranges)?;
    Ok(tsr.i(ranges.to_vec()).into_contig(RowMajor))
}

/// `dst[ranges] += src`
pub fn add_block(dst: &mut Tsr, ranges: &[Range<usize>], src: &Tsr) -> Result<()> {
    check_ranges("add_block", dst.shape(), ranges)?;
    let extents = ranges.iter().map(|r| r.len()).collect::<Vec<usize>>();
    check_shape("add_block source", src, &extents)?;
    *&mut dst.i_mut(ranges.to_vec()) += src.view();
    Ok(())
}

/* #endregion */

/* #region npy io */

/// Read an `.npy` file into a row-major tensor.
///
/// Fortran-ordered arrays are transposed on load so the returned tensor always
/// indexes like the numpy array did.
pub fn tensor_from_file(path: &Path, device: &DeviceTsr) -> Result<Tsr> {
    let bytes = std::fs::read(path)?;
    let npy = npyz::NpyFile::new(&bytes[..])?;
    let shape = npy.shape().iter().map(|&x| x as usize).collect::<Vec<usize>>();
    let fortran = npy.order() == npyz::Order::Fortran;
    let data: Vec<f64> = npy.into_vec().map_err(|e| CcError::Npy(format!("{}: {e}", path.display())))?;
    if !fortran || shape.len() < 2 {
        return Ok(tensor_from_vec(data, &shape, device));
    }
    // column-major data is row-major data of the reversed shape
    let reversed = shape.iter().rev().copied().collect::<Vec<usize>>();
    Ok(tensor_from_vec(data, &reversed, device).into_reverse_axes().into_contig(RowMajor))
}

/// Write a tensor as a C-ordered `.npy` file.
pub fn tensor_to_file(path: &Path, tsr: &Tsr) -> Result<()> {
    let shape = tsr.shape().iter().map(|&x| x as u64).collect::<Vec<u64>>();
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    let mut writer = npyz::WriteOptions::new().default_dtype().shape(&shape).writer(&mut file).begin_nd()?;
    for x in tensor_to_vec(tsr) {
        writer.push(&x)?;
    }
    writer.finish()?;
    Ok(())
}

/* #endregion */

/* #region amplitude persistence */

fn rank_name(rank: usize) -> String {
    match rank {
        1 => "Singles".into(),
        2 => "Doubles".into(),
        3 => "Triples".into(),
        4 => "Quadruples".into(),
        k => format!("Rank{k}"),
    }
}

/// `<dir>/<name><Singles|Doubles|...>Amplitudes.npy`
pub fn amplitudes_path(dir: &Path, name: &str, rank: usize) -> PathBuf {
    dir.join(format!("{name}{}Amplitudes.npy", rank_name(rank)))
}

/// Write every rank block of `amplitudes` to its own `.npy` file.
pub fn store_amplitudes(dir: &Path, name: &str, amplitudes: &AmplitudeVector) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    for (k, block) in amplitudes.blocks().iter().enumerate() {
        tensor_to_file(&amplitudes_path(dir, name, k + 1), block)?;
    }
    tracing::info!("Stored {} rank blocks of {name} amplitudes in {}", amplitudes.max_rank(), dir.display());
    Ok(())
}

/// Read amplitudes written by [`store_amplitudes`].
///
/// Returns `None` when no file of the set exists, so the caller starts from zero.
pub fn load_seed_amplitudes(
    dir: &Path,
    name: &str,
    space: &OrbitalSpace,
    max_rank: usize,
    device: &DeviceTsr,
) -> Result<Option<AmplitudeVector>> {
    let paths = (1..=max_rank).map(|k| amplitudes_path(dir, name, k)).collect_vec();
    let (present, missing): (Vec<&PathBuf>, Vec<&PathBuf>) = paths.iter().partition(|p| p.exists());
    if present.is_empty() {
        return Ok(None);
    }
    if let Some(path) = missing.first() {
        return Err(CcError::MissingSeed(path.display().to_string()));
    }
    let blocks = paths.iter().map(|p| tensor_from_file(p, device)).collect::<Result<Vec<Tsr>>>()?;
    let seed = AmplitudeVector::from_blocks(blocks)?;
    AmplitudeVector::zeros(space, max_rank, device).check_compatible(&seed)?;
    tracing::info!("Loaded {name} seed amplitudes from {}", dir.display());
    Ok(Some(seed))
}

/* #endregion */

/* #region logger */

/// Initialize the `tracing` subscriber of the binary.
///
/// `verbose = 0` logs at `INFO`, `1` at `DEBUG`, anything above at `TRACE`.
pub fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();
}

/* #endregion */

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_npy_round_trip_keeps_row_major_order() {
        let device = DeviceTsr::default();
        let dir = std::env::temp_dir().join(format!("ccsolver-util-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("block.npy");

        let data = (0..24).map(|x| x as f64 * 0.5).collect::<Vec<f64>>();
        let tsr = tensor_from_vec(data.clone(), &[2, 3, 4], &device);
        tensor_to_file(&path, &tsr).unwrap();
        let loaded = tensor_from_file(&path, &device).unwrap();

        assert_eq!(loaded.shape().as_slice(), &[2, 3, 4]);
        assert_eq!(tensor_to_vec(&loaded), data);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_slice_and_add_block() {
        let device = DeviceTsr::default();
        let tsr = tensor_from_vec((0..12).map(|x| x as f64).collect(), &[3, 4], &device);
        let sliced = slice_block(&tsr, &[1..3, 2..4]).unwrap();
        assert_eq!(tensor_to_vec(&sliced), vec![6.0, 7.0, 10.0, 11.0]);

        let mut dst = tensor_from_vec(vec![0.0; 12], &[3, 4], &device);
        add_block(&mut dst, &[1..3, 2..4], &sliced).unwrap();
        add_block(&mut dst, &[1..3, 2..4], &sliced).unwrap();
        let data = tensor_to_vec(&dst);
        assert_eq!(data[7], 14.0);
        assert_eq!(data[11], 22.0);
        assert_eq!(data.iter().sum::<f64>(), 68.0);
        assert!(slice_block(&tsr, &[0..4, 0..1]).is_err());
        assert!(add_block(&mut dst, &[0..2, 0..2], &slice_block(&sliced, &[0..2, 0..1]).unwrap()).is_err());
    }

    #[test]
    fn test_fortran_order_file_is_transposed_on_load() {
        let device = DeviceTsr::default();
        let dir = std::env::temp_dir().join(format!("ccsolver-fortran-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fortran.npy");

        // column-major [2, 3]: x[i, j] = 10 i + j
        let column_major = vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0];
        let mut file = std::io::BufWriter::new(std::fs::File::create(&path).unwrap());
        let mut writer = npyz::WriteOptions::new()
            .default_dtype()
            .shape(&[2, 3])
            .order(npyz::Order::Fortran)
            .writer(&mut file)
            .begin_nd()
            .unwrap();
        column_major.iter().for_each(|x| writer.push(x).unwrap());
        writer.finish().unwrap();
        drop(file);

        let loaded = tensor_from_file(&path, &device).unwrap();
        assert_eq!(loaded.shape().as_slice(), &[2, 3]);
        assert_eq!(tensor_to_vec(&loaded), vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_check_shape_reports_mismatch() {
        let device = DeviceTsr::default();
        let tsr = tensor_from_vec(vec![0.0; 6], &[2, 3], &device);
        assert!(check_shape("block", &tsr, &[2, 3]).is_ok());
        assert!(matches!(check_shape("block", &tsr, &[3, 2]), Err(CcError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_amplitude_store_and_seed_load() {
        let device = DeviceTsr::default();
        let space = crate::test_support::toy_space(2, 3);
        let dir = std::env::temp_dir().join(format!("ccsolver-seed-{}", std::process::id()));
        assert!(load_seed_amplitudes(&dir, "Cc", &space, 2, &device).unwrap().is_none());

        let t = crate::test_support::random_amplitudes(&space, 2, 7, &device);
        store_amplitudes(&dir, "Cc", &t).unwrap();
        assert!(dir.join("CcSinglesAmplitudes.npy").exists());
        let seed = load_seed_amplitudes(&dir, "Cc", &space, 2, &device).unwrap().unwrap();
        crate::test_support::assert_amplitudes_close(&seed, &t, 1e-15);

        let wrong_space = crate::test_support::toy_space(3, 3);
        assert!(matches!(
            load_seed_amplitudes(&dir, "Cc", &wrong_space, 2, &device),
            Err(CcError::ShapeMismatch { .. })
        ));

        std::fs::remove_file(amplitudes_path(&dir, "Cc", 2)).unwrap();
        assert!(matches!(load_seed_amplitudes(&dir, "Cc", &space, 2, &device), Err(CcError::MissingSeed(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_rank_file_names() {
        let dir = Path::new("out");
        assert_eq!(amplitudes_path(dir, "Ccsd", 4), dir.join("CcsdQuadruplesAmplitudes.npy"));
        assert_eq!(amplitudes_path(dir, "Ccsd", 5), dir.join("CcsdRank5Amplitudes.npy"));
    }
}
