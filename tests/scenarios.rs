mod common;

use common::{age_request, kyc_request, Harness, Script};
use issuer_node::error::IssuerError;
use issuer_node::merkle::TreeKind;
use issuer_node::models::state::StateStatus;
use issuer_node::services::link_engine::CreateLinkRequest;
use issuer_node::services::publisher::ConfirmOutcome;
use issuer_node::services::revocation::nonce_key;
use issuer_node::utils::crypto::Hash;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn genesis_then_signature_credential_then_publication() {
    let h = Harness::new(Script::Confirm);
    let issuer = h.identity().await;

    let credential = assert_ok!(h.node.issuer.issue(&issuer, age_request("did:x:alice", 19900101)).await);
    assert!(credential.signature_proof.is_some());
    assert!(credential.inclusion_proof.is_none());
    assert_ne!(credential.revocation_nonce, 0);
    assert!(credential.credential_status.id.ends_with(&format!("/claims/revocation/status/{}", credential.revocation_nonce)));

    let states = h.node.states.states(&issuer).unwrap();
    assert_eq!(states.len(), 2);
    assert_eq!(states[0].status, StateStatus::Confirmed);
    assert_eq!(states[1].status, StateStatus::Created);
    assert_eq!(states[1].mutations, 1);
    let claims = h.node.engine.open(&issuer, TreeKind::Claims);
    let mtp = h.node.engine.proof(&claims, &credential.index_hash, &states[1].claims_root).unwrap();
    assert!(mtp.verify_inclusion(&states[1].claims_root, &credential.index_hash, &credential.value_hash));
    let before = h.node.engine.proof(&claims, &credential.index_hash, &states[0].claims_root).unwrap();
    assert!(before.verify_non_inclusion(&states[0].claims_root, &credential.index_hash));

    let report = h.node.verifier.verify(&credential).await.unwrap();
    assert_eq!(report.signature_valid, Some(true));
    assert!(report.valid);

    // Publication attaches the inclusion proof and opens the next state.
    let confirmed = h.publish_and_confirm(&issuer).await;
    assert_eq!(confirmed.seq, 1);
    assert_eq!(confirmed.status, StateStatus::Confirmed);
    assert_eq!(confirmed.block_number, Some(100));

    let credential = h.node.issuer.get(&credential.id).unwrap();
    let inclusion = credential.inclusion_proof.as_ref().expect("inclusion proof attached");
    assert_eq!(Some(inclusion.issuer_state.state), confirmed.state);
    assert!(inclusion.mtp.verify_inclusion(&confirmed.claims_root, &credential.index_hash, &credential.value_hash));

    let open = h.node.states.pending_state(&issuer).unwrap().expect("next state opened");
    assert_eq!(open.seq, 2);
    assert_eq!(open.status, StateStatus::Created);
    let roots = h.node.engine.open(&issuer, TreeKind::Roots);
    let proof = h.node.engine.proof(&roots, &confirmed.claims_root, &open.roots_root).unwrap();
    assert!(proof.verify_inclusion(&open.roots_root, &confirmed.claims_root, &Hash::ZERO));
}

#[tokio::test]
async fn revocation_history_is_queryable_per_state() {
    let h = Harness::new(Script::Confirm);
    let issuer = h.identity().await;
    let credential = h.node.issuer.issue(&issuer, kyc_request("did:x:bob", "NL")).await.unwrap();
    let nonce = credential.revocation_nonce;
    let first = h.publish_and_confirm(&issuer).await;

    h.node.revocation.revoke(&issuer, nonce).await.unwrap();
    // Not visible until the revocation is published.
    assert!(!h.node.revocation.status_latest(&issuer, nonce).unwrap().revoked);
    let second = h.publish_and_confirm(&issuer).await;

    let at_first = h.node.revocation.status_at(&issuer, nonce, &first.state.unwrap()).unwrap();
    assert!(!at_first.revoked);
    assert!(at_first.mtp.verify_non_inclusion(&first.revocation_root, &nonce_key(nonce)));

    let at_second = h.node.revocation.status_at(&issuer, nonce, &second.state.unwrap()).unwrap();
    assert!(at_second.revoked);
    assert!(at_second.mtp.verify_inclusion(&second.revocation_root, &nonce_key(nonce), &Hash::ZERO));
    assert_eq!(at_second.issuer.state, second.state.unwrap());

    let report = h.node.verifier.verify(&h.node.issuer.get(&credential.id).unwrap()).await.unwrap();
    assert!(report.revoked);
    assert!(!report.valid);
}

#[tokio::test]
async fn failed_publication_is_retried_with_the_same_state() {
    let h = Harness::new(Script::FailOnPoll("gas".into()));
    let issuer = h.identity().await;
    h.node.issuer.issue(&issuer, age_request("did:x:carol", 20000101)).await.unwrap();

    let publishing = h.node.publisher.publish_identity(&issuer).await.unwrap();
    let sealed_hash = publishing.state.unwrap();
    let outcome = h.node.publisher.confirm_identity(&issuer).await.unwrap();
    assert_eq!(outcome, ConfirmOutcome::Failed("gas".into()));
    assert_eq!(h.node.states.state_by_seq(&issuer, 1).unwrap().status, StateStatus::Failed("gas".into()));

    // A failed state blocks further sealing until it is retried.
    h.node.issuer.issue(&issuer, age_request("did:x:dave", 20000101)).await.unwrap();
    assert!(matches!(h.node.publisher.publish_identity(&issuer).await, Err(IssuerError::PublicationInFlight)));

    h.anchor.set(Script::Confirm);
    let resubmitted = h.node.publisher.retry(&issuer).await.unwrap();
    assert_eq!(resubmitted.state, Some(sealed_hash));
    let confirmed = match h.node.publisher.confirm_identity(&issuer).await.unwrap() {
        ConfirmOutcome::Confirmed(state) => state,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(confirmed.state, Some(sealed_hash));

    let submitted = h.anchor.submitted();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0].new_state, submitted[1].new_state);
    assert!(submitted[0].is_old_state_genesis);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_link_redemption_respects_capacity() {
    let h = Harness::new(Script::Confirm);
    let issuer = h.identity().await;
    let template = kyc_request("did:x:unused", "DE").credential_subject;
    let link = h
        .node
        .links
        .create_link(
            &issuer,
            CreateLinkRequest {
                schema_url: common::KYC_SCHEMA.into(),
                credential_type: "KYCCountry".into(),
                template,
                max_issuance: Some(3),
                valid_until: None,
                credential_expiration: None,
                signature: true,
                merkle_inclusion: false,
                active: true,
            },
        )
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let links = h.node.links.clone();
        let id = link.id;
        tasks.push(tokio::spawn(async move { links.redeem(&id, &format!("did:x:holder{}", i)).await }));
    }
    let mut issued = 0;
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => issued += 1,
            Err(IssuerError::LinkExhausted) => exhausted += 1,
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    assert_eq!(issued, 3);
    assert_eq!(exhausted, 7);
    let link = h.node.links.get_link(&link.id).unwrap();
    assert_eq!(link.remaining(), Some(0));
    let through_link = h.node.issuer.list(&issuer, &Default::default()).unwrap();
    assert_eq!(through_link.iter().filter(|c| c.link_id == Some(link.id)).count(), 3);
}

#[tokio::test]
async fn one_anchoring_in_flight_per_identity() {
    let h = Harness::new(Script::Hold);
    let issuer = h.identity().await;
    let a = h.node.issuer.issue(&issuer, kyc_request("did:x:erin", "FR")).await.unwrap();
    let publishing = h.node.publisher.publish_identity(&issuer).await.unwrap();
    assert_eq!(publishing.status, StateStatus::Publishing);

    let b = h.node.issuer.issue(&issuer, kyc_request("did:x:frank", "FR")).await.unwrap();
    assert_eq!(a.state_seq, 1);
    assert_eq!(b.state_seq, 2);
    let states = h.node.states.states(&issuer).unwrap();
    assert_eq!(states[2].status, StateStatus::Created);
    assert_eq!(states[2].mutations, 1);

    assert_err!(h.node.publisher.publish_identity(&issuer).await);
    assert_eq!(h.node.publisher.confirm_identity(&issuer).await.unwrap(), ConfirmOutcome::Pending);
    assert_eq!(h.anchor.submitted().len(), 1);

    h.anchor.release();
    let first = match h.node.publisher.confirm_identity(&issuer).await.unwrap() {
        ConfirmOutcome::Confirmed(state) => state,
        other => panic!("unexpected {:?}", other),
    };
    assert!(h.node.issuer.get(&a.id).unwrap().inclusion_proof.is_some());
    assert!(h.node.issuer.get(&b.id).unwrap().inclusion_proof.is_none());
    assert!(matches!(h.node.issuer.deliver(&b.id), Err(IssuerError::StateNotYetPublished(_))));

    let second = h.node.publisher.publish_identity(&issuer).await.unwrap();
    assert_eq!(second.seq, 2);
    assert_eq!(second.previous_state, first.state);
    assert_eq!(h.anchor.submitted().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn issuance_continues_while_a_submission_is_blocked() {
    let h = Harness::new(Script::Gate);
    let issuer = h.identity().await;
    h.node.issuer.issue(&issuer, age_request("did:x:gina", 19850101)).await.unwrap();

    let publisher = h.node.publisher.clone();
    let did = issuer.clone();
    let blocked = tokio::spawn(async move { publisher.publish_identity(&did).await });

    // Wait for the seal; the submission then waits on the gate.
    let mut sealed = false;
    for _ in 0..200 {
        if h.node.states.state_by_seq(&issuer, 1).unwrap().status == StateStatus::Pending {
            sealed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(sealed);

    let b = h.node.issuer.issue(&issuer, age_request("did:x:hank", 19850101)).await.unwrap();
    assert_eq!(b.state_seq, 2);
    assert!(matches!(h.node.publisher.publish_identity(&issuer).await, Err(IssuerError::PublicationInFlight)));

    h.anchor.open_gate();
    let publishing = blocked.await.unwrap().unwrap();
    assert_eq!(publishing.seq, 1);
    assert!(matches!(h.node.publisher.confirm_identity(&issuer).await.unwrap(), ConfirmOutcome::Confirmed(_)));
    assert_eq!(h.anchor.submitted().len(), 1);
}
