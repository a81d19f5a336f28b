use approx::assert_relative_eq;
use lightstage::{
    image::RadianceImage,
    sequencer::HdrSequencer,
    svr::{Bound, Patch, SvrInfo},
};
use rstest::rstest;

fn linear_svr(width: usize, height: usize) -> SvrInfo {
    let patch = Patch {
        min: [0.0; 3],
        max: [1.0; 3],
        response: (0..=100).map(|i| [i as f32 / 100.0; 3]).collect(),
    };
    SvrInfo::new(
        vec![patch],
        (1, 1),
        width as f64,
        (width as f64, height as f64),
        (0.0, 0.0),
    )
    .unwrap()
}

/// Displayed radiance of a frame sequence under a linear response.
fn reconstruct(frames: &[RadianceImage], x: usize, y: usize, scale: f64) -> f32 {
    frames
        .iter()
        .map(|f| f.get(x, y).unwrap()[0])
        .sum::<f32>()
        / scale as f32
}

#[test]
fn frames_reconstruct_required_radiance() {
    let svr = linear_svr(2, 2);
    let min = svr.get_min_max_screen(2, 2, Bound::Min);
    let ceiling = svr.get_min_max_screen(2, 2, Bound::Max);
    let required = RadianceImage::from_pixels(
        2,
        2,
        vec![[2.5; 3], [1.0; 3], [0.0; 3], [0.4; 3]],
    )
    .unwrap();

    let seq = HdrSequencer::new(3)
        .decompose(&required, &min, &ceiling, &svr)
        .unwrap();

    assert_relative_eq!(seq.scale, 1.2, epsilon = 1e-6);
    let brightest: Vec<f32> = seq.frames.iter().map(|f| f.get(0, 0).unwrap()[0]).collect();
    assert_eq!(brightest, vec![1.0, 1.0, 1.0]);

    for (x, y, value) in [(0, 0, 2.5), (1, 0, 1.0), (0, 1, 0.0), (1, 1, 0.4)] {
        assert_relative_eq!(reconstruct(&seq.frames, x, y, seq.scale), value, epsilon = 0.01);
    }
    // Light is packed into the leading frames.
    assert_eq!(seq.frames[2].get(1, 1), Some(&[0.0; 3]));
}

#[rstest]
#[case(1)]
#[case(4)]
#[case(10)]
fn auto_scale_uses_every_frame(#[case] frames: usize) {
    let svr = linear_svr(4, 4);
    let min = svr.get_min_max_screen(4, 4, Bound::Min);
    let ceiling = svr.get_min_max_screen(4, 4, Bound::Max);
    let required = RadianceImage::from_pixels(
        4,
        4,
        (0..16).map(|i| [i as f32 / 4.0; 3]).collect(),
    )
    .unwrap();

    let seq = HdrSequencer::new(frames)
        .decompose(&required, &min, &ceiling, &svr)
        .unwrap();

    assert_eq!(seq.frames.len(), frames);
    assert_relative_eq!(seq.scale, frames as f64 / 3.75, epsilon = 1e-6);
    let last = seq.frames.last().unwrap();
    assert_relative_eq!(last.get(3, 3).unwrap()[0], 1.0, epsilon = 0.01);
}

#[test]
fn upscaled_frames_match_panel() {
    let svr = linear_svr(2, 2);
    let min = svr.get_min_max_screen(2, 2, Bound::Min);
    let ceiling = svr.get_min_max_screen(2, 2, Bound::Max);
    let required = RadianceImage::filled(2, 2, [0.5; 3]);

    let seq = HdrSequencer::new(2)
        .with_upscale(6, 4)
        .decompose(&required, &min, &ceiling, &svr)
        .unwrap();
    assert!(seq.frames.iter().all(|f| f.dimensions() == (6, 4)));
}
