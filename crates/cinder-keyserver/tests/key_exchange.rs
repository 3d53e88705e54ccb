//! Two clients complete a handshake through the key server, backed by an
//! on-disk database.

use std::sync::Arc;

use cinder_crypto::keys::generate_identity_key_pair;
use cinder_crypto::x3dh::{initiate_with_bundle, respond};
use cinder_crypto::{EphemeralKeyPair, KeyMaterial, MessageCipher, TripleDesHmac};
use cinder_keyserver::service::{FinalizeRequest, InitiateRequest};
use cinder_keyserver::session::{default_conversation_id, SessionMaterial, SessionState};
use cinder_keyserver::store::sqlite::SqliteStore;
use cinder_keyserver::{KeyServer, KeyServerConfig, ServerError};
use tempfile::TempDir;

fn sqlite_server(dir: &TempDir) -> KeyServer {
    let path = dir.path().join("keys.db");
    let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
    KeyServer::new(Arc::new(store), KeyServerConfig::default())
}

#[test]
fn alice_and_bob_agree_through_the_server() {
    let dir = TempDir::new().unwrap();
    let server = sqlite_server(&dir);

    let mut bob = KeyMaterial::generate(2);
    server.publish_bundle("bob", &bob.export_bundle()).unwrap();

    // Alice opens a session; the server hands her otpk-0 and burns it.
    let alice = generate_identity_key_pair();
    let alice_eph = EphemeralKeyPair::generate();
    let opened = server
        .initiate_session(
            "alice",
            InitiateRequest {
                recipient: "bob".into(),
                initiator_identity_key: alice.public_key,
                initiator_ephemeral_key: alice_eph.public_key,
                conversation_id: None,
            },
        )
        .unwrap();
    assert_eq!(opened.used_one_time_pre_key_id.as_deref(), Some("otpk-0"));
    assert_eq!(opened.conversation_id, default_conversation_id("alice", "bob"));
    assert_eq!(server.prekey_count("bob").unwrap().count, 1);

    let alice_keys = initiate_with_bundle(
        &alice,
        &alice_eph,
        &opened.recipient_bundle_snapshot,
        opened.used_one_time_pre_key_id.as_deref(),
    )
    .unwrap();

    // Bob polls before Alice finalizes and sees nothing yet.
    assert_eq!(
        server.fetch_session("bob", &opened.session_id).unwrap(),
        SessionMaterial::Pending
    );

    server
        .finalize_session(
            "alice",
            &FinalizeRequest {
                session_id: opened.session_id.clone(),
                initiator_identity_key: alice.public_key,
                initiator_ephemeral_key: alice_eph.public_key,
            },
        )
        .unwrap();

    let listed = server.sessions_for("bob", Some(SessionState::Finalized)).unwrap();
    assert_eq!(listed.len(), 1);

    let SessionMaterial::Ready(material) = server.fetch_session("bob", &opened.session_id).unwrap()
    else {
        panic!("session should be ready after finalize");
    };
    let bob_keys = respond(
        &mut bob,
        &material.initiator_identity_key,
        &material.initiator_ephemeral_key,
        material.one_time_pre_key_id.as_deref(),
    )
    .unwrap();

    assert_eq!(alice_keys.enc_key, bob_keys.enc_key);
    assert_eq!(alice_keys.mac_key, bob_keys.mac_key);

    let alice_cipher = TripleDesHmac::new(alice_keys.into_conversation_keys());
    let bob_cipher = TripleDesHmac::new(bob_keys.into_conversation_keys());
    let sealed = alice_cipher.seal(b"hello").unwrap();
    assert_eq!(bob_cipher.open(&sealed).unwrap(), b"hello");
}

#[test]
fn exhausted_recipient_falls_back_to_three_terms() {
    let dir = TempDir::new().unwrap();
    let server = sqlite_server(&dir);

    let mut bob = KeyMaterial::generate(0);
    server.publish_bundle("bob", &bob.export_bundle()).unwrap();

    let alice = generate_identity_key_pair();
    let eph = EphemeralKeyPair::generate();
    let opened = server
        .initiate_session(
            "alice",
            InitiateRequest {
                recipient: "bob".into(),
                initiator_identity_key: alice.public_key,
                initiator_ephemeral_key: eph.public_key,
                conversation_id: Some("team-chat".into()),
            },
        )
        .unwrap();
    assert_eq!(opened.used_one_time_pre_key_id, None);
    assert_eq!(opened.conversation_id, "team-chat");

    let a = initiate_with_bundle(&alice, &eph, &opened.recipient_bundle_snapshot, None).unwrap();
    let b = respond(&mut bob, &alice.public_key, &eph.public_key, None).unwrap();
    assert_eq!(a.master_key, b.master_key);
}

#[test]
fn concurrent_initiators_get_distinct_prekeys() {
    const PREKEYS: u32 = 5;
    const INITIATORS: usize = 12;

    let dir = TempDir::new().unwrap();
    let server = sqlite_server(&dir);
    server
        .publish_bundle("bob", &KeyMaterial::generate(PREKEYS).export_bundle())
        .unwrap();

    let used: Vec<Option<String>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..INITIATORS)
            .map(|i| {
                let server = &server;
                s.spawn(move || {
                    server
                        .initiate_session(
                            &format!("user-{i}"),
                            InitiateRequest {
                                recipient: "bob".into(),
                                initiator_identity_key: [1; 32],
                                initiator_ephemeral_key: [2; 32],
                                conversation_id: None,
                            },
                        )
                        .unwrap()
                        .used_one_time_pre_key_id
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut ids: Vec<String> = used.iter().flatten().cloned().collect();
    assert_eq!(ids.len(), PREKEYS as usize);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), PREKEYS as usize);
    assert_eq!(server.sessions_for("bob", None).unwrap().len(), INITIATORS);
}

#[test]
fn state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let session_id = {
        let server = sqlite_server(&dir);
        server
            .publish_bundle("bob", &KeyMaterial::generate(1).export_bundle())
            .unwrap();
        let opened = server
            .initiate_session(
                "alice",
                InitiateRequest {
                    recipient: "bob".into(),
                    initiator_identity_key: [1; 32],
                    initiator_ephemeral_key: [2; 32],
                    conversation_id: None,
                },
            )
            .unwrap();
        server
            .finalize_session(
                "alice",
                &FinalizeRequest {
                    session_id: opened.session_id.clone(),
                    initiator_identity_key: [1; 32],
                    initiator_ephemeral_key: [2; 32],
                },
            )
            .unwrap();
        opened.session_id
    };

    let server = sqlite_server(&dir);
    assert!(server.fetch_bundle("bob").unwrap().one_time_pre_keys.is_empty());
    assert!(matches!(
        server.fetch_session("bob", &session_id).unwrap(),
        SessionMaterial::Ready(_)
    ));
    let err = server
        .finalize_session(
            "alice",
            &FinalizeRequest {
                session_id,
                initiator_identity_key: [1; 32],
                initiator_ephemeral_key: [2; 32],
            },
        )
        .unwrap_err();
    assert!(matches!(err, ServerError::AlreadyFinalized(_)));
}
