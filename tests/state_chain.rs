// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: carried-state recurrence, prefill/step equivalence,
//! corruption handling and prefill policies over a stub model.
//!
//! Run: `cargo test --test state_chain`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::as_conversions,
    clippy::missing_docs_in_private_items,
    missing_docs
)]

mod common;

use common::{StubModel, bits, session, session_with};
use rwkv_chain::{
    ChainError, ChatConfig, HostRuntime, Logits, PenaltyParams, PrefillPolicy, Runtime, Sampler,
    SamplingMode, Session,
};

/// Last layer's latest state output, read straight from its slot.
fn last_layer_state(session: &Session<HostRuntime>) -> Vec<f32> {
    let chain = session.engine().chain();
    chain
        .read_layer_state(session.runtime(), chain.num_layers() - 1)
        .unwrap()
        .to_f32_vec()
}

// ---------------------------------------------------------------------------
// End-to-end scenario
// ---------------------------------------------------------------------------

#[test]
fn two_layer_prefill_of_two_tokens() {
    let (mut session, stub) = session(2, PrefillPolicy::Reset);
    session.prefill(&[5, 9]).unwrap();

    assert_eq!(
        stub.order(),
        [
            "embedding", "block_0", "block_1", "embedding", "block_0", "block_1", "lm_head"
        ]
    );
    let chain = session.engine().chain();
    assert_eq!(chain.state_writes(0), 2);
    assert_eq!(chain.state_writes(1), 2);
    assert_eq!(session.engine().head_launches(), 1);

    // First pass starts from a zero state.
    let first_block = &stub.launches_of("block_0")[0];
    assert!(first_block.inputs[1].iter().all(|&v| v == 0.0));

    // The head saw layer 1's activation after token 9.
    let head = &stub.launches_of("lm_head")[0];
    let last_activation = session
        .runtime()
        .copy_d2h(chain.slot(1).unwrap().activation)
        .unwrap()
        .to_f32_vec();
    assert_eq!(head.inputs[0], last_activation);
    // Token 9 embeds as [9, 1] and block_0 adds it into its own row.
    assert_eq!(stub.launches_of("embedding")[1].inputs[0], vec![9.0]);

    let mut greedy = Sampler::new(SamplingMode::Greedy, None);
    let token = greedy
        .sample(&Logits::new(vec![0.1, 5.2, 3.0]), &[])
        .unwrap();
    assert_eq!(token, 1);
}

// ---------------------------------------------------------------------------
// Recurrence
// ---------------------------------------------------------------------------

#[test]
fn carried_state_is_last_layers_latest_output() {
    let (mut session, stub) = session(3, PrefillPolicy::Continue);
    session.prefill(&[1, 2, 3]).unwrap();

    for token in [4_u32, 5, 6, 7] {
        let carried = session.carried_state().unwrap().to_f32_vec();
        assert_eq!(carried, last_layer_state(&session));
        let layer0 = session
            .engine()
            .chain()
            .read_layer_state(session.runtime(), 0)
            .unwrap()
            .to_f32_vec();
        assert_ne!(carried, layer0, "layer 0 must not seed the next pass");

        stub.clear_log();
        session.step(token).unwrap();
        let seeded = &stub.launches_of("block_0")[0].inputs[1];
        assert_eq!(*seeded, carried);
    }
}

#[test]
fn within_pass_state_flows_layer_to_layer() {
    let (mut session, stub) = session(3, PrefillPolicy::Reset);
    session.prefill(&[8]).unwrap();
    let blocks: Vec<_> = (0..3)
        .map(|i| stub.launches_of(&format!("block_{i}"))[0].clone())
        .collect();
    // Row 0 written by block_0 reaches block_1 and block_2 untouched.
    assert_eq!(blocks[1].inputs[1][..2], blocks[2].inputs[1][..2]);
    assert_ne!(blocks[0].inputs[1][..2], blocks[1].inputs[1][..2]);
    // Activations are copied forward, not recomputed.
    assert_ne!(blocks[0].inputs[0], blocks[1].inputs[0]);
}

#[test]
fn prefill_is_deterministic() {
    let tokens = [3, 1, 4, 1, 5, 9, 2, 6];
    let (mut a, _) = session(2, PrefillPolicy::Reset);
    let (mut b, _) = session(2, PrefillPolicy::Reset);
    let la = a.prefill(&tokens).unwrap();
    let lb = b.prefill(&tokens).unwrap();
    assert_eq!(bits(la.as_slice()), bits(lb.as_slice()));

    // Same session again, after an unrelated turn and a reset.
    a.step(7).unwrap();
    a.reset();
    let again = a.prefill(&tokens).unwrap();
    assert_eq!(bits(again.as_slice()), bits(la.as_slice()));
}

#[test]
fn prefill_equals_successive_steps() {
    let (mut whole, _) = session(2, PrefillPolicy::Reset);
    let (mut stepped, _) = session(2, PrefillPolicy::Reset);

    let lw = whole.prefill(&[3, 7]).unwrap();
    stepped.step(3).unwrap();
    let ls = stepped.step(7).unwrap();

    assert_eq!(bits(lw.as_slice()), bits(ls.as_slice()));
    assert_eq!(
        whole.carried_state().unwrap(),
        stepped.carried_state().unwrap()
    );
    assert_eq!(whole.generation_state(), stepped.generation_state());
    // The head only ran for the last prefill token.
    assert_eq!(whole.engine().head_launches(), 1);
    assert_eq!(stepped.engine().head_launches(), 2);
}

// ---------------------------------------------------------------------------
// Sampling modes
// ---------------------------------------------------------------------------

#[test]
fn unsupported_mode_leaves_state_untouched() {
    let (mut session, stub) = session(2, PrefillPolicy::Reset);
    session.prefill(&[5, 9]).unwrap();
    let before = session.carried_state().unwrap();
    let launches = stub.launches().len();

    let err = SamplingMode::from_name("unsupported_mode", PenaltyParams::default()).unwrap_err();
    assert!(matches!(err, ChainError::UnsupportedSamplingMode(ref m) if m == "unsupported_mode"));

    let config = ChatConfig {
        generation_mode: "unsupported_mode".into(),
        ..ChatConfig::default()
    };
    assert!(matches!(
        config.sampler().unwrap_err(),
        ChainError::UnsupportedSamplingMode(_)
    ));

    // No greedy_head in this model.
    assert!(matches!(
        session.sample_on_device().unwrap_err(),
        ChainError::UnsupportedSamplingMode(_)
    ));

    assert!(!session.is_corrupted());
    assert_eq!(session.carried_state().unwrap(), before);
    assert_eq!(stub.launches().len(), launches);
}

#[test]
fn device_greedy_matches_host_greedy() {
    let (mut session, _) = session_with(2, PrefillPolicy::Reset, true);
    let logits = session.prefill(&[2, 11, 4]).unwrap();
    let before = session.carried_state().unwrap();
    let on_device = session.sample_on_device().unwrap();
    let on_host = Sampler::new(SamplingMode::Greedy, None)
        .sample(&logits, &[])
        .unwrap();
    assert_eq!(on_device, on_host);
    assert_eq!(session.carried_state().unwrap(), before);
}

#[test]
fn device_greedy_needs_logits_from_a_pass() {
    let (mut session, stub) = session_with(2, PrefillPolicy::Reset, true);
    assert!(matches!(
        session.sample_on_device().unwrap_err(),
        ChainError::EmptyInput(_)
    ));
    assert!(stub.launches().is_empty());

    session.step(3).unwrap();
    session.sample_on_device().unwrap();

    session.reset();
    stub.clear_log();
    assert!(matches!(
        session.sample_on_device().unwrap_err(),
        ChainError::EmptyInput(_)
    ));
    assert!(stub.launches_of("greedy_head").is_empty());
    assert!(!session.is_corrupted());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[test]
fn mid_pass_failure_corrupts_until_reset() {
    let (mut session, stub) = session(2, PrefillPolicy::Reset);
    session.prefill(&[1, 2]).unwrap();

    stub.fail_next("block_1");
    let err = session.step(3).unwrap_err();
    match err {
        ChainError::SubnetExecution { subnet, .. } => assert_eq!(subnet, "block_1"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(session.is_corrupted());

    let launches = stub.launches().len();
    assert!(matches!(session.step(3), Err(ChainError::SessionCorrupted)));
    assert!(matches!(session.prefill(&[4]), Err(ChainError::SessionCorrupted)));
    assert!(matches!(session.carried_state(), Err(ChainError::SessionCorrupted)));
    assert_eq!(stub.launches().len(), launches, "refused calls must not launch");

    session.reset();
    assert!(!session.is_corrupted());
    let recovered = session.prefill(&[4]).unwrap();
    let (mut fresh, _) = common::session(2, PrefillPolicy::Reset);
    let expected = fresh.prefill(&[4]).unwrap();
    assert_eq!(bits(recovered.as_slice()), bits(expected.as_slice()));
}

#[test]
fn head_failure_also_corrupts() {
    let (mut session, stub) = session(2, PrefillPolicy::Continue);
    stub.fail_next("lm_head");
    assert!(session.prefill(&[1, 2]).is_err());
    assert!(session.is_corrupted());
}

#[test]
fn rejected_input_does_not_corrupt() {
    let (mut session, stub) = session(2, PrefillPolicy::Continue);
    session.prefill(&[1]).unwrap();
    let before = session.carried_state().unwrap();
    let launches = stub.launches().len();

    assert!(matches!(
        session.prefill(&[2, 99]),
        Err(ChainError::TokenOutOfRange { token: 99, .. })
    ));
    assert!(matches!(session.prefill(&[]), Err(ChainError::EmptyInput(_))));
    assert!(matches!(
        session.step(16),
        Err(ChainError::TokenOutOfRange { token: 16, vocab_size: 16 })
    ));

    assert!(!session.is_corrupted());
    assert_eq!(stub.launches().len(), launches);
    assert_eq!(session.carried_state().unwrap(), before);
}

#[test]
fn rejected_prompt_does_not_reset_context() {
    let (mut session, _) = session(2, PrefillPolicy::Reset);
    session.prefill(&[1, 2]).unwrap();
    let before = session.carried_state().unwrap();
    assert!(session.prefill(&[3, 40]).is_err());
    assert_eq!(session.carried_state().unwrap(), before);
    assert_eq!(session.generation_state().position, 2);
}

// ---------------------------------------------------------------------------
// Prefill policies
// ---------------------------------------------------------------------------

#[test]
fn reset_policy_starts_each_prompt_fresh() {
    let (mut session, _) = session(2, PrefillPolicy::Reset);
    session.prefill(&[3, 5]).unwrap();
    let second = session.prefill(&[7]).unwrap();

    let (mut fresh, _) = common::session(2, PrefillPolicy::Reset);
    let expected = fresh.prefill(&[7]).unwrap();
    assert_eq!(bits(second.as_slice()), bits(expected.as_slice()));
    assert_eq!(session.generation_state().position, 1);
}

#[test]
fn continue_policy_keeps_history() {
    let (mut session, _) = session(2, PrefillPolicy::Continue);
    session.prefill(&[3, 5]).unwrap();
    let second = session.prefill(&[7]).unwrap();

    let (mut whole, _) = common::session(2, PrefillPolicy::Reset);
    let expected = whole.prefill(&[3, 5, 7]).unwrap();
    assert_eq!(bits(second.as_slice()), bits(expected.as_slice()));
    assert_eq!(session.generation_state().position, 3);
    assert_eq!(session.generation_state().last_token, Some(7));
}

// ---------------------------------------------------------------------------
// Handoff traffic
// ---------------------------------------------------------------------------

#[test]
fn one_host_conversion_per_token() {
    let layers = 3;
    let (mut session, _) = session(layers, PrefillPolicy::Continue);
    session.prefill(&[1]).unwrap();

    let before = session.runtime().stats();
    session.step(2).unwrap();
    let after = session.runtime().stats();

    // Token upload plus the converted activation.
    assert_eq!(after.h2d_copies - before.h2d_copies, 2);
    // Conversion read plus the logits.
    assert_eq!(after.d2h_copies - before.d2h_copies, 2);
    // Seed state, two per inner hop, one into the head.
    assert_eq!(
        after.d2d_copies - before.d2d_copies,
        1 + 2 * (layers as u64 - 1) + 1
    );
    assert_eq!(after.launches - before.launches, 1 + layers as u64 + 1);
}

#[test]
fn fresh_prefill_uploads_zero_seed_once() {
    let (mut session, _) = session(2, PrefillPolicy::Reset);
    let before = session.runtime().stats();
    session.prefill(&[1, 2, 3]).unwrap();
    let after = session.runtime().stats();
    // Three tokens, three conversions, one zero seed.
    assert_eq!(after.h2d_copies - before.h2d_copies, 3 + 3 + 1);
}

#[test]
fn stub_model_logs_every_kernel() {
    let mut rt = HostRuntime::cpu();
    let stub = StubModel::install(&mut rt, 1, false);
    assert_eq!(rt.subnet_count(), 3);
    assert!(stub.launches().is_empty());
}
