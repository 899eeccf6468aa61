//! End-to-end encrypt/decrypt through the engine with in-memory collaborators.

mod common;

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use common::{list_dir, noise, pw, Harness, ProgressLog, OTHER, OWNER};
use fcrypt_core::{
    AuditOp, AuditStatus, DeleteMode, FcryptError, MetadataPort, CIPHERTEXT_EXTENSION,
};
use fcrypt_engine::{EncryptOptions, Hooks};
use fcrypt_store::{MemoryAuditLog, MemoryBackup};

const PLAIN: EncryptOptions = EncryptOptions { compress: false };
const GZIP: EncryptOptions = EncryptOptions { compress: true };

#[test]
fn hello_world_frame_layout() {
    let h = Harness::new();
    h.set_password(OWNER, "Passw0rd!");
    let input = h.plaintext("hello.txt", b"hello world\n");

    let record = h
        .encryptor
        .encrypt(&input, OWNER, &pw("Passw0rd!"), PLAIN, &Hooks::default())
        .unwrap();

    assert_eq!(fs::metadata(&record.path).unwrap().len(), 12 + 16);
    assert_eq!(record.original_size, 12);
    assert_eq!(record.algorithm, "AES-GCM-256");
    assert!(!record.compressed);
    assert_eq!(record.iv.len(), 12);
    assert_eq!(record.salt.len(), 32);
    assert_eq!(record.original_name, "hello.txt");
    assert!(record.stored_name.ends_with("__hello.txt.encrypted"));
    assert!(!input.exists(), "plaintext should be erased");

    let out = h
        .encryptor
        .decrypt(&record, OWNER, &pw("Passw0rd!"), Some(&h.out_dir()), &Hooks::default())
        .unwrap();
    assert_eq!(out, h.out_dir().join("hello.txt"));
    assert_eq!(fs::read(&out).unwrap(), b"hello world\n");
    assert!(!record.path.exists(), "ciphertext should be erased");
    assert!(h.metadata.is_empty(), "record should be deleted");

    let ops: Vec<_> = h.audit.entries().iter().map(|e| (e.op, e.status)).collect();
    assert_eq!(
        ops,
        vec![
            (AuditOp::Encrypt, AuditStatus::Success),
            (AuditOp::Decrypt, AuditStatus::Success)
        ]
    );
}

#[test]
fn round_trip_at_buffer_boundaries() {
    const B: usize = 4096;
    let h = Harness::with_options(|o| o.with_buffer_size(B));
    h.set_password(OWNER, "pw");

    for compress in [false, true] {
        for (i, len) in [0, 1, B - 1, B, B + 1, 10 * B].into_iter().enumerate() {
            let data = noise(len, i as u64 + 1);
            let name = format!("f{i}-{compress}.bin");
            let input = h.plaintext(&name, &data);

            let record = h
                .encryptor
                .encrypt(&input, OWNER, &pw("pw"), EncryptOptions { compress }, &Hooks::default())
                .unwrap();
            assert_eq!(record.original_size, len as u64);
            if !compress {
                assert_eq!(
                    fs::metadata(&record.path).unwrap().len(),
                    len as u64 + 16,
                    "len {len}"
                );
            }

            let out = h
                .encryptor
                .decrypt(&record, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
                .unwrap();
            assert_eq!(fs::read(&out).unwrap(), data, "len {len} compress {compress}");
        }
    }
}

#[test]
fn five_mib_with_progress() {
    let h = Harness::with_options(|o| o.with_buffer_size(1024 * 1024));
    h.set_password(OWNER, "pw");
    let data = noise(5 * 1024 * 1024, 7);
    let input = h.plaintext("big.bin", &data);

    let progress = Arc::new(ProgressLog::default());
    let hooks = Hooks::with_progress(progress.clone());
    let record = h
        .encryptor
        .encrypt(&input, OWNER, &pw("pw"), PLAIN, &hooks)
        .unwrap();
    assert_eq!(
        fs::metadata(&record.path).unwrap().len(),
        5 * 1024 * 1024 + 16
    );

    let fractions = progress.fractions();
    assert!(fractions.len() >= 5, "got {fractions:?}");
    assert!(fractions.windows(2).all(|w| w[0] < w[1]), "got {fractions:?}");
    assert_eq!(fractions.last().copied(), Some(1.0));

    let out = h
        .encryptor
        .decrypt(&record, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
        .unwrap();
    assert_eq!(fs::read(out).unwrap(), data);
}

#[test]
fn wrong_password_leaves_no_output() {
    let h = Harness::new();
    h.set_password(OWNER, "correct");
    let input = h.plaintext("secret.txt", b"top secret");
    let record = h
        .encryptor
        .encrypt(&input, OWNER, &pw("correct"), PLAIN, &Hooks::default())
        .unwrap();

    let err = h
        .encryptor
        .decrypt(&record, OWNER, &pw("wrong"), Some(&h.out_dir()), &Hooks::default())
        .unwrap_err();
    assert!(matches!(err, FcryptError::AuthenticationFailed), "got {err:?}");
    assert!(!h.out_dir().join("secret.txt").exists());
    assert!(record.path.exists(), "ciphertext must survive a failed decrypt");
    assert!(h.metadata.find_by_id(record.file_id).unwrap().is_some());

    let last = h.audit.entries().pop().unwrap();
    assert_eq!((last.op, last.status), (AuditOp::Decrypt, AuditStatus::Failure));
}

#[test]
fn encrypt_with_wrong_password_is_refused() {
    let h = Harness::new();
    h.set_password(OWNER, "correct");
    let input = h.plaintext("a.txt", b"data");

    let err = h
        .encryptor
        .encrypt(&input, OWNER, &pw("nope"), PLAIN, &Hooks::default())
        .unwrap_err();
    assert!(matches!(err, FcryptError::AuthenticationFailed));
    assert!(input.exists());
    assert!(list_dir(&h.storage_dir()).is_empty());
    assert!(h
        .audit
        .entries()
        .iter()
        .all(|e| e.status != AuditStatus::Success));
}

#[test]
fn encrypt_without_verifier_is_invalid() {
    let h = Harness::new();
    let input = h.plaintext("a.txt", b"data");
    let err = h
        .encryptor
        .encrypt(&input, OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap_err();
    assert!(matches!(err, FcryptError::InvalidParameter(_)));
}

#[test]
fn every_flipped_byte_is_rejected() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let input = h.plaintext("t.txt", b"tamper me please");
    let record = h
        .encryptor
        .encrypt(&input, OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();
    let pristine = fs::read(&record.path).unwrap();

    for i in 0..pristine.len() {
        let mut tampered = pristine.clone();
        tampered[i] ^= 0x01;
        fs::write(&record.path, &tampered).unwrap();

        let err = h
            .encryptor
            .decrypt(&record, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
            .unwrap_err();
        assert!(
            matches!(err, FcryptError::AuthenticationFailed | FcryptError::Corrupted(_)),
            "byte {i}: {err:?}"
        );
        assert!(list_dir(&h.out_dir()).is_empty(), "byte {i} left output");
    }
}

#[test]
fn truncated_ciphertext_is_corrupted() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let input = h.plaintext("t.txt", b"some text");
    let record = h
        .encryptor
        .encrypt(&input, OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();
    fs::write(&record.path, [0u8; 10]).unwrap();

    let err = h
        .encryptor
        .decrypt(&record, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
        .unwrap_err();
    assert!(matches!(err, FcryptError::Corrupted(_)), "got {err:?}");
    assert!(list_dir(&h.out_dir()).is_empty());
}

#[test]
fn iv_and_salt_never_repeat() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let mut seen = HashSet::new();
    for i in 0..12 {
        let input = h.plaintext(&format!("same-{i}.txt"), b"identical content");
        let record = h
            .encryptor
            .encrypt(&input, OWNER, &pw("pw"), PLAIN, &Hooks::default())
            .unwrap();
        assert!(seen.insert((record.iv, record.salt)));
    }
}

#[test]
fn not_owner_touches_nothing() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let input = h.plaintext("mine.txt", b"mine");
    let record = h
        .encryptor
        .encrypt(&input, OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();
    let audits_before = h.audit.entries().len();

    let err = h
        .encryptor
        .decrypt(&record, OTHER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
        .unwrap_err();
    assert!(matches!(err, FcryptError::NotOwner));
    assert!(!h.out_dir().exists());
    assert!(record.path.exists());

    let err = h.encryptor.delete(&record, OTHER).unwrap_err();
    assert!(matches!(err, FcryptError::NotOwner));
    assert!(record.path.exists());
    assert_eq!(h.audit.entries().len(), audits_before);
}

#[test]
fn overwrite_erase_removes_plaintext() {
    let h = Harness::with_options(|o| o.with_delete_mode(DeleteMode::Overwrite, 3));
    h.set_password(OWNER, "pw");
    let input = h.plaintext("wipe.txt", &noise(10_000, 3));
    let record = h
        .encryptor
        .encrypt(&input, OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();
    assert!(!input.exists());

    let out = h
        .encryptor
        .decrypt(&record, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
        .unwrap();
    assert_eq!(fs::read(out).unwrap(), noise(10_000, 3));
    assert!(!record.path.exists());
}

#[test]
fn compressed_ciphertext_is_shorter() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let zeros = vec![0u8; 1024 * 1024];

    let plain = h
        .encryptor
        .encrypt(&h.plaintext("z1.bin", &zeros), OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();
    let packed = h
        .encryptor
        .encrypt(&h.plaintext("z2.bin", &zeros), OWNER, &pw("pw"), GZIP, &Hooks::default())
        .unwrap();

    let plain_len = fs::metadata(&plain.path).unwrap().len();
    let packed_len = fs::metadata(&packed.path).unwrap().len();
    assert!(packed_len < plain_len, "{packed_len} >= {plain_len}");
    assert!(packed.compressed);
    assert_eq!(packed.original_size, zeros.len() as u64);
}

#[test]
fn insert_failure_removes_ciphertext() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let input = h.plaintext("keep.txt", b"must survive");
    h.metadata.fail_inserts(true);

    let err = h
        .encryptor
        .encrypt(&input, OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap_err();
    assert!(matches!(err, FcryptError::MetadataError(_)), "got {err:?}");
    assert_eq!(fs::read(&input).unwrap(), b"must survive");
    assert!(list_dir(&h.storage_dir()).is_empty());
    assert!(h
        .audit
        .entries()
        .iter()
        .all(|e| e.status != AuditStatus::Success));
}

#[test]
fn existing_output_is_not_overwritten() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let input = h.plaintext("dup.txt", b"new content");
    let record = h
        .encryptor
        .encrypt(&input, OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();

    fs::create_dir_all(h.out_dir()).unwrap();
    fs::write(h.out_dir().join("dup.txt"), b"existing").unwrap();
    let err = h
        .encryptor
        .decrypt(&record, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
        .unwrap_err();
    assert!(matches!(err, FcryptError::InvalidParameter(_)));
    assert_eq!(fs::read(h.out_dir().join("dup.txt")).unwrap(), b"existing");
    assert!(record.path.exists());
}

#[test]
fn decrypt_defaults_to_ciphertext_directory() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let record = h
        .encryptor
        .encrypt(&h.plaintext("here.txt", b"x"), OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();

    let out = h
        .encryptor
        .decrypt(&record, OWNER, &pw("pw"), None, &Hooks::default())
        .unwrap();
    assert_eq!(out.parent(), record.path.parent());
    assert_eq!(fs::read(out).unwrap(), b"x");
}

#[test]
fn missing_ciphertext_without_backup() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let record = h
        .encryptor
        .encrypt(&h.plaintext("gone.txt", b"x"), OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();
    fs::remove_file(&record.path).unwrap();

    let err = h
        .encryptor
        .decrypt(&record, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
        .unwrap_err();
    assert!(matches!(err, FcryptError::CiphertextMissing(_)));
}

#[test]
fn missing_ciphertext_restored_from_backup() {
    let backup = Arc::new(MemoryBackup::new());
    let h = Harness::build(|o| o, Arc::new(MemoryAuditLog::new()), Some(backup.clone()));
    h.set_password(OWNER, "pw");
    let record = h
        .encryptor
        .encrypt(&h.plaintext("cloud.txt", b"from the mirror"), OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();
    backup.put(&record.stored_name, fs::read(&record.path).unwrap());
    fs::remove_file(&record.path).unwrap();

    let out = h
        .encryptor
        .decrypt(&record, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
        .unwrap();
    assert_eq!(fs::read(out).unwrap(), b"from the mirror");
}

#[test]
fn legacy_salt_fallback() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let record = h
        .encryptor
        .encrypt(&h.plaintext("old.txt", b"legacy"), OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();

    // Simulate a record written when the file was keyed with the verifier salt.
    let verifier = {
        use fcrypt_core::PasswordVerifierPort;
        h.verifiers.get_verifier(OWNER).unwrap().unwrap()
    };
    let legacy = tempfile::tempdir().unwrap();
    let key = fcrypt_crypto::derive_key(&pw("pw"), &verifier.verifier_salt, 100_000).unwrap();
    let mut buf = fcrypt_crypto::ChunkBuffer::new(4096).unwrap();
    let sealed = legacy.path().join("sealed");
    fcrypt_crypto::encrypt_stream(
        &key,
        &record.iv,
        &mut &b"legacy"[..],
        fs::File::create(&sealed).unwrap(),
        &mut buf,
    )
    .unwrap();
    fs::copy(&sealed, &record.path).unwrap();

    let out = h
        .encryptor
        .decrypt(&record, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
        .unwrap();
    assert_eq!(fs::read(out).unwrap(), b"legacy");
}

#[test]
fn delete_erases_and_forgets() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let record = h
        .encryptor
        .encrypt(&h.plaintext("d.txt", b"bye"), OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();

    h.encryptor.delete(&record, OWNER).unwrap();
    assert!(!record.path.exists());
    assert!(h.metadata.find_by_id(record.file_id).unwrap().is_none());
    let last = h.audit.entries().pop().unwrap();
    assert_eq!((last.op, last.status), (AuditOp::Delete, AuditStatus::Success));
}

#[test]
fn audit_failures_do_not_fail_operations() {
    let h = Harness::build(|o| o, Arc::new(MemoryAuditLog::failing()), None);
    h.set_password(OWNER, "pw");
    let record = h
        .encryptor
        .encrypt(&h.plaintext("a.txt", b"ok"), OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();
    let out = h
        .encryptor
        .decrypt(&record, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
        .unwrap();
    assert_eq!(fs::read(out).unwrap(), b"ok");
}

#[test]
fn stored_name_outside_convention_is_corrupted() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let mut record = h
        .encryptor
        .encrypt(&h.plaintext("a.txt", b"ok"), OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();
    record.stored_name = "a.txt".into();
    assert!(!record.stored_name.ends_with(CIPHERTEXT_EXTENSION));

    let err = h
        .encryptor
        .decrypt(&record, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
        .unwrap_err();
    assert!(matches!(err, FcryptError::Corrupted(_)));
}

#[test]
fn record_outside_storage_dir_is_refused() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let record = h
        .encryptor
        .encrypt(&h.plaintext("a.txt", b"ok"), OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();

    let elsewhere = h.dir.path().join("elsewhere");
    fs::create_dir_all(&elsewhere).unwrap();
    let victim = elsewhere.join(&record.stored_name);
    fs::write(&victim, b"not a ciphertext of ours").unwrap();
    let mut moved = record.clone();
    moved.path = victim.clone();

    let err = h.encryptor.delete(&moved, OWNER).unwrap_err();
    assert!(matches!(err, FcryptError::Corrupted(_)), "got {err:?}");
    let err = h
        .encryptor
        .decrypt(&moved, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
        .unwrap_err();
    assert!(matches!(err, FcryptError::Corrupted(_)), "got {err:?}");

    assert_eq!(fs::read(&victim).unwrap(), b"not a ciphertext of ours");
    assert!(record.path.exists());
    assert!(h.metadata.find_by_id(record.file_id).unwrap().is_some());
}

#[test]
fn record_delete_failure_after_decrypt_is_not_audited_as_failure() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let record = h
        .encryptor
        .encrypt(&h.plaintext("a.txt", b"ok"), OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap();
    h.metadata.fail_deletes(true);

    let err = h
        .encryptor
        .decrypt(&record, OWNER, &pw("pw"), Some(&h.out_dir()), &Hooks::default())
        .unwrap_err();
    assert!(matches!(err, FcryptError::MetadataError(_)), "got {err:?}");
    assert_eq!(fs::read(h.out_dir().join("a.txt")).unwrap(), b"ok");

    let ops: Vec<_> = h.audit.entries().iter().map(|e| (e.op, e.status)).collect();
    assert_eq!(
        ops,
        vec![
            (AuditOp::Encrypt, AuditStatus::Success),
            (AuditOp::Decrypt, AuditStatus::Success)
        ]
    );
}

#[cfg(unix)]
#[test]
fn symlinked_input_is_refused() {
    let h = Harness::new();
    h.set_password(OWNER, "pw");
    let target = h.plaintext("real.txt", b"plaintext behind a link");
    let link = h.dir.path().join("plain/link.txt");
    std::os::unix::fs::symlink(&target, &link).unwrap();

    let err = h
        .encryptor
        .encrypt(&link, OWNER, &pw("pw"), PLAIN, &Hooks::default())
        .unwrap_err();
    assert!(matches!(err, FcryptError::InvalidParameter(_)), "got {err:?}");
    assert_eq!(fs::read(&target).unwrap(), b"plaintext behind a link");
    assert!(fs::symlink_metadata(&link).is_ok());
    assert!(list_dir(&h.storage_dir()).is_empty());
}
