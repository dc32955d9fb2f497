mod common;

use aip_replica::{
    content::{ContentRepository, ObjectType},
    models::task::{AuditOutcome, TaskStatus},
    pack::{CatalogPacker, Packer},
    tasks::{
        BagItReplaceWithAip, BagItRestoreFromAip, CompareWithAip, CompareWithManifest,
        CurationTask, DeletionEvent, DeletionRecorder, EstimateAipSize, FetchAip, FetchManifest,
        RemoveAip, RemoveManifest, TransmitAip, TransmitManifest, TransmitSingleAip, VerifyAip, VerifyManifest,
        catalog_deletion,
    },
};
use common::{COLLECTION, COMMUNITY, ITEM, bitstream, harness, seed, seed_item, title};

#[tokio::test]
async fn transmit_verify_fetch_and_estimate() {
    let h = harness().await;
    seed(&h.repo).await;

    let outcome = TransmitAip::new(h.manager.clone()).perform(COMMUNITY).await;
    assert_eq!(outcome.status, TaskStatus::Success, "{}", outcome.result);
    assert!(outcome.result.starts_with("3 AIPs"));
    assert_eq!(h.manager.odometer().await.count, 3);

    for handle in [COMMUNITY, COLLECTION, ITEM] {
        let verified = VerifyAip::new(h.manager.clone()).perform(handle).await;
        assert!(verified.is_success(), "{}", verified.result);
    }
    let fetched = FetchAip::new(h.manager.clone()).perform(ITEM).await;
    assert!(fetched.is_success(), "{}", fetched.result);

    let missing = VerifyAip::new(h.manager.clone()).perform("123456789/404").await;
    assert_eq!(missing.status, TaskStatus::Fail);

    let estimate = EstimateAipSize::new(h.manager.clone(), aip_replica::pack::SizeMethod::Recurse);
    assert_eq!(estimate.estimate(ITEM).await.unwrap(), 109);
    assert!(estimate.perform(ITEM).await.result.contains("109 bytes"));
}

#[tokio::test]
async fn single_transmit_does_not_descend() {
    let h = harness().await;
    seed(&h.repo).await;
    let outcome = TransmitSingleAip::new(h.manager.clone())
        .perform(COLLECTION)
        .await;
    assert!(outcome.is_success());
    assert_eq!(h.manager.odometer().await.count, 1);
    assert!(
        !VerifyAip::new(h.manager.clone())
            .perform(ITEM)
            .await
            .is_success()
    );
}

#[tokio::test]
async fn regeneration_audit_detects_changes() {
    let h = harness().await;
    seed(&h.repo).await;
    let audit = CompareWithAip::new(h.manager.clone());
    let item = h.repo.find(ITEM).await.unwrap().unwrap();
    assert_eq!(audit.audit_checksum(&item).await.unwrap(), AuditOutcome::Missing);

    TransmitAip::new(h.manager.clone()).perform(COMMUNITY).await;
    assert_eq!(audit.audit_checksum(&item).await.unwrap(), AuditOutcome::Match);
    let outcome = audit.perform(COLLECTION).await;
    assert!(outcome.is_success(), "{}", outcome.result);

    h.repo
        .replace_metadata(ITEM, vec![title("Retitled")])
        .await
        .unwrap();
    let item = h.repo.find(ITEM).await.unwrap().unwrap();
    assert_eq!(audit.audit_checksum(&item).await.unwrap(), AuditOutcome::Mismatch);
    assert_eq!(audit.perform(ITEM).await.status, TaskStatus::Fail);
}

#[tokio::test]
async fn extent_audit_visits_every_member() {
    let h = harness().await;
    seed(&h.repo).await;
    seed_item(&h.repo, "123456789/43", COLLECTION).await;
    seed_item(&h.repo, "123456789/44", COLLECTION).await;

    let transmit = TransmitSingleAip::new(h.manager.clone());
    assert!(transmit.perform(COLLECTION).await.is_success());
    assert!(transmit.perform("123456789/43").await.is_success());

    let audit = CompareWithAip::new(h.manager.clone());
    let collection = h.repo.find(COLLECTION).await.unwrap().unwrap();
    let report = audit.audit_extent(&collection).await.unwrap();
    assert_eq!(report.checked.len(), 3);
    assert_eq!(report.missing, vec![ITEM.to_string(), "123456789/44".to_string()]);

    let outcome = audit.perform(COLLECTION).await;
    assert_eq!(outcome.status, TaskStatus::Fail);
    assert!(outcome.result.contains("2 of 3 members missing"), "{}", outcome.result);
}

#[tokio::test]
async fn delete_then_restore_rebuilds_the_subtree() {
    let h = harness().await;
    seed(&h.repo).await;
    seed_item(&h.repo, "123456789/43", COLLECTION).await;
    let before = h.repo.find(COLLECTION).await.unwrap().unwrap();
    let before_items: Vec<String> = h
        .repo
        .items(COLLECTION)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.handle)
        .collect();
    let item_before = h.repo.find(ITEM).await.unwrap().unwrap();

    assert!(TransmitAip::new(h.manager.clone()).perform(COMMUNITY).await.is_success());
    let catalog_id = catalog_deletion(&h.manager, COLLECTION).await.unwrap();
    assert_eq!(catalog_id, "COLLECTION@123456789-2.zip");
    h.repo.delete(COLLECTION).await.unwrap();
    assert!(h.repo.find(ITEM).await.unwrap().is_none());

    let outcome = BagItRestoreFromAip::new(h.manager.clone())
        .perform(COLLECTION)
        .await;
    assert!(outcome.is_success(), "{}", outcome.result);
    assert!(outcome.result.starts_with("3 objects restored"));

    let after = h.repo.find(COLLECTION).await.unwrap().unwrap();
    assert_eq!(after.metadata, before.metadata);
    assert_eq!(after.owner.as_deref(), Some(COMMUNITY));
    let after_items: Vec<String> = h
        .repo
        .items(COLLECTION)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.handle)
        .collect();
    assert_eq!(after_items, before_items);

    let item_after = h.repo.find(ITEM).await.unwrap().unwrap();
    let (mut a, mut b) = (item_before.metadata.clone(), item_after.metadata.clone());
    a.sort();
    b.sort();
    assert_eq!(a, b);
    assert_eq!(
        h.repo.bitstream_content(ITEM, "ORIGINAL", 1).await.unwrap().len(),
        100
    );

    // the catalog is consumed
    assert!(!h.manager.object_exists("delete", &catalog_id).await.unwrap());
}

#[tokio::test]
async fn restore_without_catalog_fails_cleanly() {
    let h = harness().await;
    seed(&h.repo).await;
    let objects = h.repo.len().await;
    let before = h.manager.odometer().await;

    let outcome = BagItRestoreFromAip::new(h.manager.clone())
        .perform("123456789/77")
        .await;
    assert_eq!(outcome.status, TaskStatus::Fail);
    assert!(outcome.result.contains("no deletion catalog"), "{}", outcome.result);
    assert_eq!(h.repo.len().await, objects);
    assert_eq!(h.manager.odometer().await, before);

    let existing = BagItRestoreFromAip::new(h.manager.clone())
        .perform(ITEM)
        .await;
    assert_eq!(existing.status, TaskStatus::Skip);
}

#[tokio::test]
async fn remove_of_deleted_object_consumes_its_catalog() {
    let h = harness().await;
    seed(&h.repo).await;
    assert!(TransmitAip::new(h.manager.clone()).perform(COMMUNITY).await.is_success());
    let catalog_id = catalog_deletion(&h.manager, COLLECTION).await.unwrap();
    h.repo.delete(COLLECTION).await.unwrap();
    assert_eq!(h.manager.odometer().await.count, 4);

    let outcome = RemoveAip::new(h.manager.clone()).perform(COLLECTION).await;
    assert!(outcome.is_success(), "{}", outcome.result);
    assert!(outcome.result.starts_with("2 AIPs"), "{}", outcome.result);
    assert!(!h.manager.object_exists("delete", &catalog_id).await.unwrap());
    assert!(
        !h.manager
            .object_exists("store", "ITEM@123456789-42.zip")
            .await
            .unwrap()
    );
    // only the community package is left
    assert_eq!(h.manager.odometer().await.count, 1);

    let live = RemoveAip::new(h.manager.clone()).perform(COMMUNITY).await;
    assert!(live.result.starts_with("1 AIPs"), "{}", live.result);
    let reading = h.manager.odometer().await;
    assert_eq!((reading.count, reading.storesize), (0, 0));
}

#[tokio::test]
async fn replace_reapplies_stored_packages() {
    let h = harness().await;
    seed(&h.repo).await;
    assert!(TransmitAip::new(h.manager.clone()).perform(COLLECTION).await.is_success());
    let original = h.repo.find(ITEM).await.unwrap().unwrap().metadata;

    h.repo
        .replace_metadata(ITEM, vec![title("Vandalised")])
        .await
        .unwrap();
    h.repo.clear_bundles(ITEM).await.unwrap();

    let outcome = BagItReplaceWithAip::new(h.manager.clone())
        .perform(COLLECTION)
        .await;
    assert!(outcome.is_success(), "{}", outcome.result);
    let restored = h.repo.find(ITEM).await.unwrap().unwrap();
    let (mut a, mut b) = (original, restored.metadata);
    a.sort();
    b.sort();
    assert_eq!(a, b);
    assert_eq!(h.repo.bundles(ITEM).await.unwrap().len(), 2);
}

#[tokio::test]
async fn manifest_audit_stops_at_first_mismatch() {
    let h = harness().await;
    seed(&h.repo).await;
    h.repo
        .add_bitstream(ITEM, "ORIGINAL", bitstream("appendix.pdf", 3, false, b"appendix"))
        .await
        .unwrap();

    let outcome = TransmitManifest::new(h.manager.clone())
        .perform(COMMUNITY)
        .await;
    assert!(outcome.is_success(), "{}", outcome.result);
    assert!(
        VerifyManifest::new(h.manager.clone())
            .perform(ITEM)
            .await
            .is_success()
    );

    let audit = CompareWithManifest::new(h.manager.clone());
    let clean = audit.audit(COMMUNITY).await.unwrap();
    assert_eq!(clean.failure, None);
    assert_eq!(clean.checked, 3);

    // replace bitstream 1 with different bytes
    h.repo
        .add_bitstream(ITEM, "ORIGINAL", bitstream("paper.pdf", 1, true, &[8u8; 100]))
        .await
        .unwrap();
    let tampered = audit.audit(COMMUNITY).await.unwrap();
    assert_eq!(tampered.checked, 1);
    let failure = tampered.failure.unwrap();
    assert!(failure.contains("123456789/42/1"), "{failure}");

    let outcome = audit.perform(ITEM).await;
    assert_eq!(outcome.status, TaskStatus::Fail);
    assert!(outcome.result.contains("checksum mismatch for 123456789/42/1"));
}

#[tokio::test]
async fn manifest_audit_reports_missing_manifest() {
    let h = harness().await;
    seed(&h.repo).await;
    let outcome = CompareWithManifest::new(h.manager.clone())
        .perform(ITEM)
        .await;
    assert_eq!(outcome.status, TaskStatus::Fail);
    assert!(outcome.result.contains("ITEM@123456789-42.txt missing"), "{}", outcome.result);
}

#[tokio::test]
async fn manifests_can_be_fetched_and_removed() {
    let h = harness().await;
    seed(&h.repo).await;
    assert!(TransmitManifest::new(h.manager.clone()).perform(COLLECTION).await.is_success());
    assert!(FetchManifest::new(h.manager.clone()).perform(ITEM).await.is_success());

    let removed = RemoveManifest::new(h.manager.clone())
        .perform(COLLECTION)
        .await;
    assert!(removed.result.starts_with("2 manifests removed"), "{}", removed.result);
    assert_eq!(
        VerifyManifest::new(h.manager.clone()).perform(ITEM).await.status,
        TaskStatus::Fail
    );
    assert_eq!(h.manager.odometer().await.count, 0);
}

#[tokio::test]
async fn recorder_coalesces_nested_deletions() {
    let h = harness().await;
    let event = |handle: &str, kind, owner: Option<&str>| DeletionEvent {
        handle: handle.to_string(),
        kind,
        owner: owner.map(str::to_string),
    };

    let mut recorder = DeletionRecorder::new(h.manager.clone());
    recorder
        .record(event("123456789/10", ObjectType::Community, Some(COMMUNITY)))
        .await
        .unwrap();
    recorder
        .record(event("123456789/11", ObjectType::Collection, Some("123456789/10")))
        .await
        .unwrap();
    recorder
        .record(event("123456789/12", ObjectType::Item, Some("123456789/11")))
        .await
        .unwrap();
    recorder
        .record(event("123456789/50", ObjectType::Item, Some(COLLECTION)))
        .await
        .unwrap();
    let written = recorder.finish().await.unwrap();
    assert_eq!(
        written,
        vec!["COMMUNITY@123456789-10.zip", "ITEM@123456789-50.zip"]
    );

    let staged = h
        .manager
        .stage("delete", &written[0])
        .await
        .unwrap();
    assert!(h.manager.fetch_object("delete", &written[0], &staged).await.unwrap() > 0);
    let mut catalog = CatalogPacker::default();
    catalog.unpack(&staged).await.unwrap();
    assert_eq!(catalog.object_id, "123456789/10");
    assert_eq!(catalog.owner_id.as_deref(), Some(COMMUNITY));
    assert_eq!(catalog.members, vec!["123456789/11", "123456789/12"]);
}
