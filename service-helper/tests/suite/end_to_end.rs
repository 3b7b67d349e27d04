use bit_service_helper::ErrorKind;
use bit_service_helper::Limits;
use bit_service_helper::UdevRulesError;
use bit_service_helper::rule_line;
use pretty_assertions::assert_eq;

use super::harness::BACKUP;
use super::harness::TestService;

#[tokio::test]
async fn add_rule_then_save_installs_it() -> anyhow::Result<()> {
    let service = TestService::start(Limits::default()).await?;
    let mut client = service.client().await?;

    client.add_rule(BACKUP, "1234-uuid").await?;
    assert!(client.save().await?);

    let expected = rule_line("/bin/su", &service.user, "1234-uuid", BACKUP);
    assert_eq!(service.rules_text().await?, Some(expected));
    assert_eq!(service.broker.staged_owner_count(), 0);
    assert_eq!(service.oracle.checks(), 1);

    // Staging the same rule again leaves the file alone.
    client.add_rule(BACKUP, "1234-uuid").await?;
    assert!(!client.save().await?);
    assert_eq!(service.oracle.checks(), 1);

    service.shutdown().await
}

#[tokio::test]
async fn save_without_anything_staged_changes_nothing() -> anyhow::Result<()> {
    let service = TestService::start(Limits::default()).await?;
    let mut client = service.client().await?;

    assert!(!client.save().await?);

    assert_eq!(service.oracle.checks(), 0);
    assert_eq!(service.rules_text().await?, None);
    service.shutdown().await
}

#[tokio::test]
async fn chained_command_is_a_validation_error() -> anyhow::Result<()> {
    let service = TestService::start(Limits::default()).await?;
    let mut client = service.client().await?;

    let err = client
        .add_rule("/usr/bin/backintime --backup && rm -rf /", "1234-uuid")
        .await
        .unwrap_err();
    assert!(matches!(err, UdevRulesError::InvalidCmd(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(service.broker.staged_owner_count(), 0);

    let err = client
        .add_rule(BACKUP, "1234-uuid; reboot")
        .await
        .unwrap_err();
    assert!(matches!(err, UdevRulesError::InvalidChar(_)), "{err:?}");

    // The connection is still usable after a rejection.
    assert!(!client.save().await?);
    service.shutdown().await
}

#[tokio::test]
async fn denial_is_reported_and_staging_survives() -> anyhow::Result<()> {
    let service = TestService::start(Limits::default()).await?;
    let mut client = service.client().await?;
    service.oracle.set_grant(false);

    client.add_rule(BACKUP, "1234-uuid").await?;
    let err = client.save().await.unwrap_err();
    assert!(matches!(err, UdevRulesError::PermissionDenied(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert_eq!(service.rules_text().await?, None);

    service.oracle.set_grant(true);
    assert!(client.save().await?);
    assert!(service.rules_text().await?.is_some());
    service.shutdown().await
}

#[tokio::test]
async fn quota_errors_keep_earlier_rules() -> anyhow::Result<()> {
    let service = TestService::start(Limits {
        max_rules: 2,
        ..Limits::default()
    })
    .await?;
    let mut client = service.client().await?;

    client.add_rule(BACKUP, "disk-1").await?;
    client.add_rule(BACKUP, "disk-2").await?;
    let err = client.add_rule(BACKUP, "disk-3").await.unwrap_err();
    assert!(matches!(err, UdevRulesError::LimitExceeded(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Quota);

    assert!(client.save().await?);
    let text = service.rules_text().await?.unwrap_or_default();
    assert_eq!(text.lines().count(), 2);
    assert!(text.contains("disk-1") && text.contains("disk-2"));
    assert!(!text.contains("disk-3"));
    service.shutdown().await
}

#[tokio::test]
async fn delete_removes_the_rules_file() -> anyhow::Result<()> {
    let service = TestService::start(Limits::default()).await?;
    let mut client = service.client().await?;

    client.add_rule(BACKUP, "1234-uuid").await?;
    assert!(client.save().await?);
    client.add_rule(BACKUP, "5678-uuid").await?;

    client.delete().await?;
    assert_eq!(service.rules_text().await?, None);
    assert_eq!(service.broker.staged_owner_count(), 0);

    // Deleting twice is fine and needs no second authorization.
    let checks = service.oracle.checks();
    client.delete().await?;
    assert_eq!(service.oracle.checks(), checks);
    service.shutdown().await
}

#[tokio::test]
async fn clean_discards_staging_only() -> anyhow::Result<()> {
    let service = TestService::start(Limits::default()).await?;
    let mut client = service.client().await?;

    client.add_rule(BACKUP, "1234-uuid").await?;
    assert!(client.save().await?);
    let installed = service.rules_text().await?;

    client.add_rule(BACKUP, "5678-uuid").await?;
    client.clean().await?;
    assert_eq!(service.broker.staged_owner_count(), 0);
    assert_eq!(service.rules_text().await?, installed);
    service.shutdown().await
}
