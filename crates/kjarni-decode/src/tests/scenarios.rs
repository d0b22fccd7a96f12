use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::ensure;
use approx::assert_abs_diff_eq;
use ndarray::array;

use super::common::*;
use crate::cache::{CacheImplementation, KVCache};
use crate::common::CancellationToken;
use crate::config::{AttentionSinkConfig, EosTokenIds, GenerationConfig};
use crate::error::GenerationError;
use crate::generation::{GenerateOptions, Generator, generate_async};
use crate::model::{FnModel, ModelOutput};
use crate::stopping::StopReason;

fn eos(id: u32) -> Option<EosTokenIds> {
    Some(EosTokenIds::from(id))
}

// ============== greedy ==============

#[test]
fn test_greedy_single_token_identity() {
    init_logging();
    let generator = Generator::new(scripted(10, |_, _| peaked(10, 7, 5.0)));
    let config = GenerationConfig {
        max_length: 4,
        ..Default::default()
    };

    let out = generator.generate(&prompt(&[&[5, 2]]), None, &config).unwrap();

    assert_eq!(out.sequences, array![[5, 2, 7, 7]]);
    assert_eq!(out.stop_reason, StopReason::MaxLength);
    assert!(out.complete);
    assert_eq!(out.steps, 2);
}

#[test]
fn test_eos_terminates_generation() {
    let log = CallLog::default();
    let generator = Generator::new(logged(10, log.clone(), |_, position| {
        if position == 2 { peaked(10, 7, 5.0) } else { peaked(10, 0, 5.0) }
    }));
    let config = GenerationConfig {
        max_length: 10,
        eos_token_id: eos(0),
        ..Default::default()
    };

    let out = generator.generate(&prompt(&[&[5, 2]]), None, &config).unwrap();

    assert_eq!(out.sequences, array![[5, 2, 7, 0]]);
    assert_eq!(out.stop_reason, StopReason::Eos);
    // no model call after the EOS step
    assert_eq!(log.calls(), 2);
    assert_eq!(out.sequences_until_eos(), vec![vec![7, 0]]);
}

#[test]
fn test_finished_rows_are_padded() {
    // row 0 emits EOS at once, row 1 only at position 4
    let generator = Generator::new(scripted(6, |row, position| {
        if row == 0 || position == 4 { peaked(6, 0, 5.0) } else { peaked(6, 3, 5.0) }
    }));
    let config = GenerationConfig {
        max_length: 10,
        eos_token_id: eos(0),
        pad_token_id: Some(5),
        ..Default::default()
    };

    let out = generator
        .generate(&prompt(&[&[1, 1], &[2, 2]]), None, &config)
        .unwrap();

    assert_eq!(out.sequences, array![[1, 1, 0, 5, 5], [2, 2, 3, 3, 0]]);
    assert_eq!(out.stop_reason, StopReason::Eos);
}

#[test]
fn test_repetition_penalty_avoids_prompt_token() {
    let generator = Generator::new(scripted(5, |_, _| vec![0.0; 5]));
    let config = GenerationConfig {
        max_length: 5,
        repetition_penalty: 2.0,
        ..Default::default()
    };

    let out = generator.generate(&prompt(&[&[1, 1, 1]]), None, &config).unwrap();

    assert_eq!(out.sequences.ncols(), 5);
    assert_ne!(out.sequences[[0, 3]], 1);
}

#[test]
fn test_min_length_blocks_early_eos() {
    let generator = Generator::new(scripted(5, |_, _| vec![4.0, 0.0, 0.0, 3.0, 0.0]));
    let config = GenerationConfig {
        max_length: 8,
        min_length: 4,
        eos_token_id: eos(0),
        ..Default::default()
    };

    let out = generator.generate(&prompt(&[&[4, 2]]), None, &config).unwrap();

    assert_eq!(out.sequences, array![[4, 2, 3, 3, 0]]);
    assert_eq!(out.stop_reason, StopReason::Eos);
}

#[test]
fn test_forced_decoder_ids_count_prompt_positions() {
    let generator = Generator::new(scripted(10, |_, _| peaked(10, 7, 5.0)));
    let config = GenerationConfig {
        max_length: 5,
        forced_decoder_ids: Some(vec![(3, 4)]),
        ..Default::default()
    };

    let out = generator.generate(&prompt(&[&[1, 2]]), None, &config).unwrap();

    assert_eq!(out.sequences, array![[1, 2, 7, 4, 7]]);
}

#[test]
fn test_sequences_never_exceed_max_length() {
    let generator = Generator::new(scripted(6, |row, position| peaked(6, (row + position) % 6, 2.0)));
    for max_length in [3, 5, 9] {
        let config = GenerationConfig {
            max_length,
            ..Default::default()
        };
        let out = generator
            .generate(&prompt(&[&[1, 2], &[3, 4]]), None, &config)
            .unwrap();
        assert!(out.sequences.ncols() <= max_length);
        assert_eq!(out.sequences.ncols(), max_length);
    }
}

#[test]
fn test_prompt_at_max_length_returns_prompt() {
    let log = CallLog::default();
    let generator = Generator::new(logged(4, log.clone(), |_, _| peaked(4, 1, 1.0)));
    let config = GenerationConfig {
        max_length: 2,
        ..Default::default()
    };

    let out = generator.generate(&prompt(&[&[3, 3]]), None, &config).unwrap();

    assert_eq!(out.sequences, array![[3, 3]]);
    assert_eq!(out.stop_reason, StopReason::MaxLength);
    assert_eq!(log.calls(), 0);
}

#[test]
fn test_output_scores_recorded_per_step() {
    let generator = Generator::new(scripted(4, |_, _| vec![0.0, 1.0, 0.0, 0.0]));
    let config = GenerationConfig {
        max_new_tokens: Some(3),
        output_scores: true,
        ..Default::default()
    };

    let out = generator.generate(&prompt(&[&[2]]), None, &config).unwrap();

    let scores = out.scores.as_ref().unwrap();
    assert_eq!(scores.len(), 3);
    assert_eq!(scores[0].dim(), (1, 4));
    assert!(out.attentions.is_none());
}

#[test]
fn test_without_cache_the_full_sequence_is_fed() {
    let widths = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_widths = widths.clone();
    let model = FnModel::new(4, LAYOUT, move |input, cache| {
        seen_widths.lock().unwrap().push(input.new_positions());
        write_cache(input, cache)?;
        Ok(ModelOutput::new(logits_for(input, 4, &|_, _| peaked(4, 2, 1.0))))
    });
    let config = GenerationConfig {
        max_new_tokens: Some(3),
        use_cache: false,
        ..Default::default()
    };

    let out = Generator::new(model).generate(&prompt(&[&[1, 1]]), None, &config).unwrap();

    assert_eq!(out.sequences, array![[1, 1, 2, 2, 2]]);
    assert_eq!(*widths.lock().unwrap(), vec![2, 3, 4]);
}

// ============== sampling ==============

#[test]
fn test_sampling_is_deterministic_with_seed() {
    let generator = Generator::new(scripted(6, |_, _| vec![0.1, 0.5, 0.3, 0.9, 0.2, 0.4]));
    let config = GenerationConfig {
        do_sample: true,
        max_new_tokens: Some(8),
        temperature: 0.7,
        top_k: Some(4),
        ..Default::default()
    };
    let ids = prompt(&[&[1, 2], &[3, 4]]);

    let run = |seed| {
        generator
            .generate_with(&ids, None, &config, GenerateOptions::default().with_seed(seed))
            .unwrap()
            .sequences
    };

    let first = run(42);
    assert_eq!(first, run(42));
    // top_k keeps tokens {1, 3, 5, 2}
    assert!(first.slice(ndarray::s![.., 2..]).iter().all(|t| [1, 2, 3, 5].contains(t)));
}

#[test]
fn test_sampling_returns_multiple_sequences_per_prompt() {
    let generator = Generator::new(scripted(4, |_, _| vec![1.0, 1.0, 1.0, 1.0]));
    let config = GenerationConfig {
        do_sample: true,
        num_return_sequences: 3,
        max_new_tokens: Some(2),
        ..Default::default()
    };

    let out = generator
        .generate_with(&prompt(&[&[1], &[2]]), None, &config, GenerateOptions::default().with_seed(7))
        .unwrap();

    assert_eq!(out.num_sequences(), 6);
    assert_eq!(out.sequences.column(0).to_vec(), vec![1, 1, 1, 2, 2, 2]);
}

// ============== beam search ==============

#[test]
fn test_beam_search_tie_break() {
    let generator = Generator::new(scripted(3, |_, position| {
        if position == 1 { vec![0.0, 0.0, 0.0] } else { vec![0.0, 1.0, 2.0] }
    }));
    let config = GenerationConfig {
        num_beams: 2,
        num_return_sequences: 2,
        max_new_tokens: Some(2),
        ..Default::default()
    };

    let out = generator.generate(&prompt(&[&[1]]), None, &config).unwrap();

    assert_eq!(out.sequences, array![[1, 0, 2], [1, 1, 2]]);
    assert_eq!(out.beam_indices.as_ref().unwrap(), &array![[0, 0], [0, 1]]);
    assert_eq!(out.stop_reason, StopReason::MaxLength);

    // (-ln 3 + 2 - ln(1 + e + e^2)) / 2
    let expected = (-(3.0f32).ln() + 2.0 - (1.0 + 1.0f32.exp() + 2.0f32.exp()).ln()) / 2.0;
    let scores = out.sequences_scores.as_ref().unwrap();
    assert_abs_diff_eq!(scores[0], expected, epsilon = 1e-5);
    assert_abs_diff_eq!(scores[1], expected, epsilon = 1e-5);
}

#[test]
fn test_beam_count_is_constant() {
    let log = CallLog::default();
    let generator = Generator::new(logged(5, log.clone(), |_, _| vec![1.0, 0.9, 0.8, 0.7, 0.6]));
    let config = GenerationConfig {
        num_beams: 3,
        max_new_tokens: Some(4),
        eos_token_id: eos(0),
        ..Default::default()
    };

    let out = generator
        .generate(&prompt(&[&[2, 2], &[3, 3]]), None, &config)
        .unwrap();

    assert_eq!(out.num_sequences(), 2);
    assert!(log.calls() > 0);
    assert!(log.batches().iter().all(|&b| b == 6));
}

#[test]
fn test_beam_search_finishes_on_eos() {
    // EOS (0) is the best continuation from the first generated position on
    let generator = Generator::new(scripted(4, |_, position| {
        if position == 2 { vec![0.0, 0.0, 3.0, 2.0] } else { vec![3.0, 0.0, 0.0, 0.0] }
    }));
    let config = GenerationConfig {
        num_beams: 2,
        max_length: 10,
        eos_token_id: eos(0),
        pad_token_id: Some(1),
        ..Default::default()
    };

    let out = generator.generate(&prompt(&[&[3, 3]]), None, &config).unwrap();

    assert_eq!(out.stop_reason, StopReason::BeamDone);
    assert_eq!(out.sequences.row(0).to_vec(), vec![3, 3, 2, 0]);
    assert_eq!(out.sequences_until_eos(), vec![vec![2, 0]]);
}

#[test]
fn test_beam_search_with_whole_vocabulary_suppressed() {
    let generator = Generator::new(scripted(3, |_, _| vec![0.5, 0.2, 0.1]));
    let config = GenerationConfig {
        num_beams: 2,
        max_length: 4,
        suppress_tokens: Some(vec![0, 1, 2]),
        ..Default::default()
    };

    let err = generator.generate(&prompt(&[&[1]]), None, &config).unwrap_err();

    assert!(
        matches!(err.root(), GenerationError::EmptyBeam { batch_idx: 0 }),
        "unexpected error: {err}"
    );
}

#[test]
fn test_beam_sample_is_deterministic_with_seed() {
    let generator = Generator::new(scripted(6, |_, position| {
        (0..6).map(|v| ((v * 7 + position * 3) % 5) as f32 * 0.4).collect()
    }));
    let config = GenerationConfig {
        num_beams: 3,
        do_sample: true,
        max_new_tokens: Some(5),
        ..Default::default()
    };
    let ids = prompt(&[&[1, 4]]);

    let run = || {
        generator
            .generate_with(&ids, None, &config, GenerateOptions::default().with_seed(3))
            .unwrap()
    };

    let first = run();
    assert_eq!(first.sequences, run().sequences);
    assert_eq!(first.sequences.ncols(), 7);
}

// ============== caches ==============

#[test]
fn test_static_cache_matches_dynamic() {
    let next = |_: usize, position: usize| peaked(8, (position * 3) % 7 + 1, 4.0);
    let shape_checked = FnModel::new(8, LAYOUT, move |input, cache| {
        if cache.is_static() {
            ensure!(input.attention_mask.ncols() == 9, "mask width {}", input.attention_mask.ncols());
        }
        write_cache(input, cache)?;
        Ok(ModelOutput::new(logits_for(input, 8, &next)))
    })
    .with_static_cache_support();
    let generator = Generator::new(shape_checked);

    let base = GenerationConfig {
        max_length: 9,
        ..Default::default()
    };
    let dynamic = GenerationConfig {
        cache_implementation: Some(CacheImplementation::Dynamic),
        ..base.clone()
    };
    let ids = prompt(&[&[2, 5, 1], &[4, 4, 4]]);

    let with_static = generator.generate(&ids, None, &base).unwrap();
    let with_dynamic = generator.generate(&ids, None, &dynamic).unwrap();

    assert_eq!(with_static.sequences, with_dynamic.sequences);
    assert_eq!(with_static.sequences.ncols(), 9);
}

#[test]
fn test_static_cache_beam_search() {
    let model = scripted(5, |_, _| vec![1.0, 0.9, 0.8, 0.7, 0.6]).with_static_cache_support();
    let config = GenerationConfig {
        num_beams: 2,
        max_new_tokens: Some(3),
        cache_implementation: Some(CacheImplementation::Static),
        ..Default::default()
    };

    let out = Generator::new(model).generate(&prompt(&[&[4]]), None, &config).unwrap();

    assert_eq!(out.sequences.ncols(), 4);
}

#[test]
fn test_static_cache_requires_model_support() {
    let config = GenerationConfig {
        cache_implementation: Some(CacheImplementation::Static),
        ..Default::default()
    };
    let err = Generator::new(scripted(4, |_, _| vec![0.0; 4]))
        .generate(&prompt(&[&[1]]), None, &config)
        .unwrap_err();
    assert!(matches!(err, GenerationError::ConflictingFlags(_)));
}

#[test]
fn test_sink_cache_bounds_memory() {
    let model = FnModel::new(6, LAYOUT, |input, cache| {
        write_cache(input, cache)?;
        ensure!(cache.length() <= 4, "cache grew to {}", cache.length());
        ensure!(input.attention_mask.ncols() == cache.length(), "mask/cache misaligned");
        Ok(ModelOutput::new(logits_for(input, 6, &|_, _| peaked(6, 3, 2.0))))
    });
    let config = GenerationConfig {
        max_new_tokens: Some(6),
        attention_sink: Some(AttentionSinkConfig {
            window_length: 4,
            num_sink_tokens: 1,
        }),
        ..Default::default()
    };

    let out = Generator::new(model)
        .generate(&prompt(&[&[1, 2, 5]]), None, &config)
        .unwrap();

    assert_eq!(out.sequences, array![[1, 2, 5, 3, 3, 3, 3, 3, 3]]);
}

// ============== contrastive ==============

#[test]
fn test_contrastive_search_avoids_repeated_states() {
    let next = |_: usize, _: usize| vec![0.0, 2.0, 1.5, 0.0];
    let config = GenerationConfig {
        penalty_alpha: Some(0.6),
        top_k: Some(2),
        max_new_tokens: Some(3),
        ..Default::default()
    };

    let out = Generator::new(scripted_with_hidden(4, next))
        .generate(&prompt(&[&[1]]), None, &config)
        .unwrap();
    assert_eq!(out.sequences, array![[1, 2, 1, 1]]);

    // no degeneration penalty is plain greedy
    let greedy = GenerationConfig {
        penalty_alpha: Some(0.0),
        ..config
    };
    let out = Generator::new(scripted_with_hidden(4, next))
        .generate(&prompt(&[&[1]]), None, &greedy)
        .unwrap();
    assert_eq!(out.sequences, array![[1, 1, 1, 1]]);
}

#[test]
fn test_contrastive_search_needs_hidden_states() {
    let config = GenerationConfig {
        penalty_alpha: Some(0.5),
        top_k: Some(2),
        max_new_tokens: Some(2),
        ..Default::default()
    };
    let err = Generator::new(scripted(4, |_, _| vec![0.0; 4]))
        .generate(&prompt(&[&[1]]), None, &config)
        .unwrap_err();
    assert!(matches!(err.root(), GenerationError::InvalidConfig(_)));
}

// ============== encoder-decoder ==============

#[test]
fn test_encoder_decoder_copies_source() {
    let generator = Generator::new(CopySeq2Seq { vocab: 6 });
    let config = GenerationConfig {
        max_length: 10,
        eos_token_id: eos(2),
        ..Default::default()
    };

    let out = generator.generate(&prompt(&[&[3, 4, 2]]), None, &config).unwrap();

    assert_eq!(out.sequences, array![[0, 3, 4, 2]]);
    assert_eq!(out.prompt_len(), 1);
    assert_eq!(out.stop_reason, StopReason::Eos);
}

#[test]
fn test_encoder_decoder_beam_search() {
    let generator = Generator::new(CopySeq2Seq { vocab: 6 });
    let config = GenerationConfig {
        num_beams: 2,
        max_length: 10,
        eos_token_id: eos(2),
        ..Default::default()
    };

    let out = generator
        .generate(&prompt(&[&[3, 4, 2], &[5, 1, 2]]), None, &config)
        .unwrap();

    assert_eq!(out.num_sequences(), 2);
    assert_eq!(out.sequences_until_eos(), vec![vec![3, 4, 2], vec![5, 1, 2]]);
}

// ============== cancellation and errors ==============

#[test]
fn test_cancelled_before_start_returns_prompt() {
    let generator = Generator::new(scripted(4, |_, _| peaked(4, 1, 1.0)));
    let options = GenerateOptions::default().with_cancellation(CancellationToken::already_cancelled());

    let out = generator
        .generate_with(&prompt(&[&[2, 3]]), None, &GenerationConfig::default(), options)
        .unwrap();

    assert!(!out.complete);
    assert_eq!(out.stop_reason, StopReason::Cancelled);
    assert_eq!(out.sequences, array![[2, 3]]);
    assert!(matches!(
        out.into_complete(),
        Err(GenerationError::CancellationRequested { steps: 0 })
    ));
}

#[test]
fn test_cancellation_keeps_partial_output() {
    let (token, handle) = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let model = FnModel::new(4, LAYOUT, move |input, cache| {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            handle.cancel();
        }
        write_cache(input, cache)?;
        Ok(ModelOutput::new(logits_for(input, 4, &|_, _| peaked(4, 3, 1.0))))
    });

    let out = Generator::new(model)
        .generate_with(
            &prompt(&[&[1]]),
            None,
            &GenerationConfig::default(),
            GenerateOptions::default().with_cancellation(token),
        )
        .unwrap();

    assert_eq!(out.steps, 2);
    assert_eq!(out.sequences, array![[1, 3, 3]]);
    assert!(!out.complete);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_beam_cancellation_finalizes_live_beams() {
    let generator = Generator::new(scripted(4, |_, _| vec![0.0, 1.0, 0.5, 0.0]));
    let config = GenerationConfig {
        num_beams: 2,
        max_new_tokens: Some(4),
        ..Default::default()
    };
    let options = GenerateOptions::default().with_cancellation(CancellationToken::already_cancelled());

    let out = generator
        .generate_with(&prompt(&[&[3]]), None, &config, options)
        .unwrap();

    assert!(!out.complete);
    assert_eq!(out.sequences, array![[3]]);
    assert!(out.sequences_scores.is_some());
}

#[test]
fn test_invalid_config_fails_before_model_call() {
    let log = CallLog::default();
    let generator = Generator::new(logged(4, log.clone(), |_, _| vec![0.0; 4]));
    let config = GenerationConfig {
        do_sample: true,
        temperature: 0.0,
        ..Default::default()
    };

    let err = generator.generate(&prompt(&[&[1]]), None, &config).unwrap_err();

    assert!(matches!(err, GenerationError::InvalidConfig(_)));
    assert_eq!(log.calls(), 0);
}

#[test]
fn test_mask_shape_is_checked() {
    let generator = Generator::new(scripted(4, |_, _| vec![0.0; 4]));
    let err = generator
        .generate(&prompt(&[&[1, 2]]), Some(&array![[1u8]]), &GenerationConfig::default())
        .unwrap_err();
    assert!(matches!(err, GenerationError::ShapeMismatch { .. }));
}

#[test]
fn test_model_failure_carries_step() {
    let calls = AtomicUsize::new(0);
    let model = FnModel::new(4, LAYOUT, move |input, cache| {
        ensure!(calls.fetch_add(1, Ordering::SeqCst) < 1, "weights went missing");
        write_cache(input, cache)?;
        Ok(ModelOutput::new(logits_for(input, 4, &|_, _| vec![0.0; 4])))
    });

    let err = Generator::new(model)
        .generate(&prompt(&[&[1]]), None, &GenerationConfig::default())
        .unwrap_err();

    match err {
        GenerationError::ModelCallableFailed { step, source } => {
            assert_eq!(step, 1);
            assert!(source.to_string().contains("weights went missing"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ============== async ==============

#[tokio::test]
async fn test_generate_async_matches_sync() {
    let model = Arc::new(scripted(10, |_, _| peaked(10, 7, 5.0)));
    let config = GenerationConfig {
        max_length: 4,
        ..Default::default()
    };

    let out = generate_async(model, prompt(&[&[5, 2]]), None, config, GenerateOptions::default())
        .await
        .unwrap();

    assert_eq!(out.sequences, array![[5, 2, 7, 7]]);
}

#[tokio::test]
async fn test_generate_async_reports_panicking_worker() {
    let model = Arc::new(FnModel::new(4, LAYOUT, |_, _| panic!("forward blew up")));

    let err = generate_async(
        model,
        prompt(&[&[1]]),
        None,
        GenerationConfig::default(),
        GenerateOptions::default(),
    )
    .await
    .unwrap_err();

    match err {
        GenerationError::WorkerFailed(message) => assert!(message.contains("panicked"), "{message}"),
        other => panic!("unexpected error: {other}"),
    }
}
