use super::*;

fn iota(n: usize) -> Vec<f32> {
    (0..n).map(|x| x as f32 + 1.).collect()
}

#[test]
fn blocked_offsets_pad_channels() {
    let desc = MemoryDesc::new(2, Dims::new(11, 1, 3, 2), Format::Blocked);
    assert_eq!(desc.stored_c(), 16);
    assert_eq!(desc.sample_len(), 16 * 6);
    assert_eq!(desc.offset(0, 0, 0), 0);
    assert_eq!(desc.offset(0, 7, 0), 7);
    assert_eq!(desc.offset(0, 0, 1), 8);
    assert_eq!(desc.offset(0, 8, 0), 48);
    assert_eq!(desc.offset(1, 0, 0), 96);
    assert!(desc.has_padding());
}

#[test]
fn channel_of_inverts_offset() {
    for format in [Format::Plain, Format::Blocked] {
        let desc = MemoryDesc::new(1, Dims::new(13, 1, 2, 3), format);
        for c in 0..13 {
            for s in 0..6 {
                assert_eq!(desc.channel_of(desc.offset(0, c, s)), c, "{format}");
            }
        }
    }
}

#[test]
fn reorder_plain_blocked_plain() -> Result<()> {
    let plain = MemoryDesc::new(3, Dims::new(10, 1, 4, 5), Format::Plain);
    let blocked = plain.with_format(Format::Blocked);
    let x = iota(plain.len());
    let mut y = vec![f32::NAN; blocked.len()];
    reorder(&plain, &x, &blocked, &mut y)?;
    for n in 0..3 {
        for c in 10..16 {
            for s in 0..20 {
                assert_eq!(y[blocked.offset(n, c, s)], 0.);
            }
        }
    }
    let mut z = vec![0.; plain.len()];
    reorder(&blocked, &y, &plain, &mut z)?;
    assert_eq!(x, z);
    Ok(())
}

#[test]
fn reorder_rejects_mismatched_dims() {
    let a = MemoryDesc::new(1, Dims::new(2, 1, 2, 2), Format::Plain);
    let b = MemoryDesc::new(1, Dims::new(3, 1, 2, 2), Format::Blocked);
    let x = vec![0.; a.len()];
    let mut y = vec![0.; b.len()];
    assert!(reorder(&a, &x, &b, &mut y).is_err());
}

#[test]
fn weight_reorder_round_trip() -> Result<()> {
    let dims = WeightDims::new(12, 3, 3, 3);
    let w = iota(dims.size());
    let blocked = reordered_weights(&dims, WeightFormat::Oihw, &w, WeightFormat::Blocked)?;
    assert_eq!(blocked.len(), 16 * 27);
    assert_eq!(
        blocked[dims.offset(WeightFormat::Blocked, 9, 2, 1, 0)],
        w[dims.offset(WeightFormat::Oihw, 9, 2, 1, 0)]
    );
    let back = reordered_weights(&dims, WeightFormat::Blocked, &blocked, WeightFormat::Oihw)?;
    assert_eq!(w, back);
    Ok(())
}

#[test]
fn threads_scale_with_work() {
    assert_eq!(parallel::get_threads(16, 1), 1);
    assert!(parallel::get_threads(1 << 30, 4) >= 1);
    assert!(parallel::get_threads(1 << 30, 4) <= rayon::current_num_threads());
}
