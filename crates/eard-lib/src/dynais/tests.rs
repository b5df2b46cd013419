use super::*;

fn run<S: LagStrategy>(detector: &mut SignatureDetector<S>, input: &[u64]) -> Vec<LoopEvent> {
    input.iter().filter_map(|&s| detector.feed(s)).collect()
}

fn repeat(pattern: &[u64], times: usize) -> Vec<u64> {
    pattern.iter().copied().cycle().take(pattern.len() * times).collect()
}

/// (A B)x4 followed by (C D E)x4, repeated
fn nested_program(iterations: usize) -> Vec<u64> {
    let mut body = repeat(&[1, 2], 4);
    body.extend(repeat(&[3, 4, 5], 4));
    repeat(&body, iterations)
}

fn noisy_stream(len: usize) -> Vec<u64> {
    let mut seed = 0x9e37_79b9_7f4a_7c15u64;
    let mut out = Vec::with_capacity(len);
    let body = nested_program(1);

    while out.len() < len {
        seed ^= seed << 7;
        seed ^= seed >> 9;
        match seed % 5 {
            0 => out.extend((0..(seed % 13)).map(|i| 100 + (seed >> 8).wrapping_add(i) % 7)),
            1 => out.extend(repeat(&[40, 41, 42, 43, 44, 45, 46], 4)),
            _ => out.extend(&body),
        }
    }
    out.truncate(len);
    out
}

#[test]
fn test_four_sample_loop_reported_once_on_third_repetition() {
    let mut detector = SignatureDetector::new(DetectorConfig::new(4, 1)).unwrap();
    let input = repeat(&[10, 11, 12, 13], 3);

    let mut events = Vec::new();
    for (i, &s) in input.iter().enumerate() {
        if let Some(event) = detector.feed(s) {
            events.push((i + 1, event));
        }
    }

    assert_eq!(events.len(), 1);
    let (position, event) = events[0];
    assert_eq!(position, 12);
    assert_eq!(event.size, 4);
    assert_eq!(event.level, 0);
    assert_eq!(event.detected_at, 12);
}

#[test]
fn test_status_sequence_for_four_sample_loop() {
    let mut detector = SignatureDetector::new(DetectorConfig::new(4, 1)).unwrap();
    let statuses: Vec<LoopStatus> = repeat(&[1, 2, 3, 4], 3)
        .into_iter()
        .map(|s| {
            detector.feed(s);
            detector.status()
        })
        .collect();

    assert!(statuses[..7].iter().all(|s| *s == LoopStatus::NoLoop));
    assert!(statuses[7..11].iter().all(|s| *s == LoopStatus::InLoop));
    assert_eq!(statuses[11], LoopStatus::NewLoop);
}

#[test]
fn test_zero_arguments_rejected() {
    let err = SignatureDetector::new(DetectorConfig::new(0, 1)).unwrap_err();
    assert!(matches!(err, EardError::InvalidArgument(_)));

    assert!(SignatureDetector::new(DetectorConfig::new(8, 0)).is_err());

    let config = DetectorConfig {
        stability_threshold: 0,
        ..DetectorConfig::new(8, 1)
    };
    assert!(SignatureDetector::new(config).is_err());
}

#[test]
fn test_levels_clamped_to_maximum() {
    let detector = SignatureDetector::new(DetectorConfig::new(8, 64)).unwrap();
    assert_eq!(detector.config().levels, MAX_LEVELS);
}

#[test]
fn test_no_event_before_window_filled() {
    for window in 1..=24usize {
        for period in 2..=6u64 {
            let mut detector = SignatureDetector::new(DetectorConfig::new(window, 3)).unwrap();
            let pattern: Vec<u64> = (0..period).collect();
            let input = repeat(&pattern, window);

            for &s in &input[..window - 1] {
                assert!(detector.feed(s).is_none(), "window {} period {}", window, period);
            }
        }

        let mut detector = SignatureDetector::new(DetectorConfig::new(window, 3)).unwrap();
        let noise = noisy_stream(window - 1);
        assert!(run(&mut detector, &noise).is_empty());
    }
}

#[test]
fn test_period_detected_on_third_repetition() {
    for period in 2..=16u64 {
        let mut detector =
            SignatureDetector::new(DetectorConfig::new(period as usize, 1)).unwrap();
        let pattern: Vec<u64> = (100..100 + period).collect();

        let events = run(&mut detector, &repeat(&pattern, 3));
        assert_eq!(events.len(), 1, "period {}", period);
        assert_eq!(events[0].size as u64, period);
        assert_eq!(events[0].detected_at, 3 * period);
    }
}

#[test]
fn test_large_window_reports_first_boundary_after_warm_up() {
    let mut detector = SignatureDetector::new(DetectorConfig::new(32, 1)).unwrap();
    let events = run(&mut detector, &repeat(&[1, 2, 3, 4, 5], 10));

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].size, 5);
    assert_eq!(events[0].detected_at, 35);
}

#[test]
fn test_identical_samples_never_form_a_loop() {
    let mut detector = SignatureDetector::new(DetectorConfig::new(16, 2)).unwrap();
    let events = run(&mut detector, &vec![7u64; 1000]);

    assert!(events.is_empty());
    assert_eq!(detector.status(), LoopStatus::NoLoop);
}

#[test]
fn test_loop_end_then_new_loop() {
    let mut detector = SignatureDetector::new(DetectorConfig::new(4, 1)).unwrap();
    let mut input = repeat(&[1, 2, 3], 4);
    input.extend(repeat(&[4, 5], 4));

    let mut events = Vec::new();
    let mut statuses = Vec::new();
    for &s in &input {
        if let Some(event) = detector.feed(s) {
            events.push((event.size, event.detected_at));
        }
        statuses.push(detector.status());
    }

    assert_eq!(events, vec![(3, 9), (2, 18)]);
    assert_eq!(statuses[12], LoopStatus::EndLoop);
    assert_eq!(statuses[17], LoopStatus::NewLoop);
    assert_eq!(detector.tracked_size(0), Some(2));
}

#[test]
fn test_outer_loop_reported_and_inner_restarts_suppressed() {
    let mut detector = SignatureDetector::new(DetectorConfig::new(16, 2)).unwrap();
    let events: Vec<(u32, usize, u64)> = run(&mut detector, &nested_program(10))
        .into_iter()
        .map(|e| (e.size, e.level, e.detected_at))
        .collect();

    assert_eq!(
        events,
        vec![
            (3, 0, 17),
            (2, 0, 26),
            (3, 0, 37),
            (2, 0, 46),
            (3, 0, 57),
            (2, 1, 66),
        ]
    );
    assert_eq!(detector.tracked_size(1), Some(2));
}

#[test]
fn test_reset_restarts_detection() {
    let mut detector = SignatureDetector::new(DetectorConfig::new(4, 1)).unwrap();
    let input = repeat(&[1, 2, 3, 4], 3);

    assert_eq!(run(&mut detector, &input).len(), 1);
    detector.reset();
    assert_eq!(detector.samples(), 0);
    assert_eq!(detector.status(), LoopStatus::NoLoop);

    let events = run(&mut detector, &input);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].detected_at, 12);
}

fn trace<S: LagStrategy>(strategy: S, config: DetectorConfig, input: &[u64]) -> Vec<(Option<LoopEvent>, LoopStatus)> {
    let mut detector = SignatureDetector::with_strategy(config, strategy).unwrap();
    input
        .iter()
        .map(|&s| {
            let event = detector.feed(s);
            (event, detector.status())
        })
        .collect()
}

#[test]
fn test_lane_strategies_match_scalar() {
    let input = noisy_stream(4000);

    for window in [7usize, 16, 33, 64] {
        let config = DetectorConfig::new(window, 3);
        let scalar = trace(ScalarLag, config, &input);

        assert!(scalar.iter().any(|(e, _)| e.is_some()));
        assert_eq!(scalar, trace(Lanes4::default(), config, &input));
        assert_eq!(scalar, trace(Lanes8::default(), config, &input));
        assert_eq!(scalar, trace(Lanes16::default(), config, &input));
    }
}
