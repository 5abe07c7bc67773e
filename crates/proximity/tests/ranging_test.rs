// Co-presence decision rule over ranging samples

use proptest::prelude::*;
use proximity::{Confidence, RangingSample, RangingWindow};

const THRESHOLD: f64 = 0.5;

fn confidence() -> impl Strategy<Value = Confidence> {
    prop_oneof![
        Just(Confidence::Low),
        Just(Confidence::Medium),
        Just(Confidence::High),
    ]
}

fn sample() -> impl Strategy<Value = RangingSample> {
    (0.0f64..1.5, confidence()).prop_map(|(distance, confidence)| RangingSample::new(distance, confidence))
}

fn qualifies(sample: &RangingSample) -> bool {
    sample.confidence >= Confidence::Medium && sample.distance_meters < THRESHOLD
}

proptest! {
    /// The window fires exactly when the last N samples all qualify
    #[test]
    fn prop_window_fires_on_qualifying_run(
        size in 1usize..6,
        samples in proptest::collection::vec(sample(), 0..40),
    ) {
        let mut window = RangingWindow::new(size, THRESHOLD);

        for (i, s) in samples.iter().enumerate() {
            let fired = window.push(*s);
            let expected = i + 1 >= size && samples[i + 1 - size..=i].iter().all(qualifies);

            prop_assert_eq!(fired.is_some(), expected, "index {} size {}", i, size);
            if let Some(mean) = fired {
                let run = &samples[i + 1 - size..=i];
                let want = run.iter().map(|s| s.distance_meters).sum::<f64>() / size as f64;
                prop_assert!((mean - want).abs() < 1e-9);
                prop_assert!(mean < THRESHOLD);
            }
        }
    }

    /// One close reading among unreliable ones never confirms co-presence
    #[test]
    fn prop_single_close_sample_is_not_enough(
        position in 0usize..10,
        noise in proptest::collection::vec(0.0f64..0.4, 10),
    ) {
        let mut window = RangingWindow::new(3, THRESHOLD);

        for (i, distance) in noise.iter().enumerate() {
            let confidence = if i == position { Confidence::High } else { Confidence::Low };
            prop_assert!(window.push(RangingSample::new(*distance, confidence)).is_none());
        }
    }
}

#[test]
fn test_boundary_distance_does_not_qualify() {
    let window = RangingWindow::new(3, THRESHOLD);
    assert!(!window.qualifies(&RangingSample::new(THRESHOLD, Confidence::High)));
    assert!(window.qualifies(&RangingSample::new(THRESHOLD - 0.01, Confidence::Medium)));
    assert!(!window.qualifies(&RangingSample::new(-0.1, Confidence::High)));
}

#[test]
fn test_interrupted_run_restarts() {
    let mut window = RangingWindow::new(3, THRESHOLD);
    let near = RangingSample::new(0.2, Confidence::High);
    let far = RangingSample::new(1.2, Confidence::High);

    assert!(window.push(near).is_none());
    assert!(window.push(near).is_none());
    assert!(window.push(far).is_none());
    assert!(window.push(near).is_none());
    assert!(window.push(near).is_none());
    let mean = window.push(near).expect("third near sample completes the window");
    assert!((mean - 0.2).abs() < 1e-9);
    assert_eq!(window.len(), 3);

    window.clear();
    assert!(window.is_empty());
}
