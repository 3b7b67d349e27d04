use std::os::unix::fs::PermissionsExt;

use bit_service_helper::Limits;
use bit_service_helper::Outcome;
use bit_service_helper::Response;
use pretty_assertions::assert_eq;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixStream;

use super::harness::BACKUP;
use super::harness::TestService;

#[tokio::test]
async fn connections_of_the_same_user_stage_separately() -> anyhow::Result<()> {
    let service = TestService::start(Limits::default()).await?;
    let mut first = service.client().await?;
    let mut second = service.client().await?;

    first.add_rule(BACKUP, "first-disk").await?;
    // The second connection has nothing staged and there is no file yet.
    assert!(!second.save().await?);
    assert_eq!(service.oracle.checks(), 0);

    assert!(first.save().await?);
    let text = service.rules_text().await?.unwrap_or_default();
    assert!(text.contains("first-disk"));
    service.shutdown().await
}

#[tokio::test]
async fn owner_quota_counts_connections() -> anyhow::Result<()> {
    let service = TestService::start(Limits {
        max_owners: 1,
        ..Limits::default()
    })
    .await?;
    let mut first = service.client().await?;
    let mut second = service.client().await?;

    first.add_rule(BACKUP, "first-disk").await?;
    first.add_rule(BACKUP, "other-disk").await?;
    let err = second.add_rule(BACKUP, "second-disk").await.unwrap_err();
    assert!(err.to_string().contains("cached users"), "{err}");

    first.clean().await?;
    second.add_rule(BACKUP, "second-disk").await?;
    service.shutdown().await
}

#[tokio::test]
async fn disconnecting_drops_staged_rules() -> anyhow::Result<()> {
    let service = TestService::start(Limits::default()).await?;
    let mut client = service.client().await?;

    client.add_rule(BACKUP, "1234-uuid").await?;
    assert_eq!(service.broker.staged_owner_count(), 1);
    drop(client);

    service.wait_for_no_staging().await?;
    assert_eq!(service.rules_text().await?, None);
    service.shutdown().await
}

#[tokio::test]
async fn malformed_request_gets_an_error_and_the_connection_survives() -> anyhow::Result<()> {
    let service = TestService::start(Limits::default()).await?;
    let stream = UnixStream::connect(&service.socket_path).await?;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"{\"id\":1,\"call\":\"reboot\"}\n").await?;
    let response: Response = serde_json::from_str(&lines.next_line().await?.unwrap_or_default())?;
    assert_eq!(response.id, 0);
    assert!(matches!(
        response.outcome,
        Outcome::Err(ref err) if err.name == "net.launchpad.backintime.Failed"
    ));

    write.write_all(b"{\"id\":2,\"call\":\"clean\"}\n").await?;
    let response: Response = serde_json::from_str(&lines.next_line().await?.unwrap_or_default())?;
    assert_eq!(response.id, 2);
    assert!(matches!(response.outcome, Outcome::Ok(_)));
    service.shutdown().await
}

#[tokio::test]
async fn oversized_request_closes_the_connection() -> anyhow::Result<()> {
    let service = TestService::start(Limits::default()).await?;
    let stream = UnixStream::connect(&service.socket_path).await?;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let mut huge = vec![b'x'; 64 * 1024];
    huge.push(b'\n');
    // The server may hang up before everything is written.
    let _ = write.write_all(&huge).await;
    assert_eq!(lines.next_line().await.ok().flatten(), None);
    service.shutdown().await
}

#[tokio::test]
async fn socket_is_open_to_everyone() -> anyhow::Result<()> {
    let service = TestService::start(Limits::default()).await?;
    let mode = std::fs::metadata(&service.socket_path)?.permissions().mode();
    assert_eq!(mode & 0o777, 0o666);
    service.shutdown().await
}
