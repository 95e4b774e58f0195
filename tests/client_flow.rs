mod support;

use bankfetch::auth::{AuthEvent, DeepLinkBuilder, DeviceMode};
use bankfetch::browser::memory::MemoryLauncher;
use bankfetch::models::Transaction;
use bankfetch::{BankClient, BankError, ClientState};
use secrecy::SecretString;
use serde_json::json;
use support::{login_browser, test_config, ymd, AUTO_START_TOKEN, QR_TOKEN};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_accounts(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/accounts/v2/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accounts": [
                {"accountNumber": "1111", "name": "Everyday", "productName": "Checking"},
                {"accountNumber": "2222", "name": "Buffer", "productName": "Savings account"}
            ]
        })))
        .mount(server)
        .await;
}

fn identity() -> SecretString {
    SecretString::from("199001011234")
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<AuthEvent>) -> Vec<AuthEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn login_fetch_and_reconcile() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_accounts(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/accounts/v2/1111/transactions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "transactions": [
                {"date": "2024-01-05", "amount": "-50.00", "description": "ACME STORE AB", "sequenceNumber": "101"},
                {"date": "2024-01-06", "amount": "-1.00", "description": "Coffee", "status": "pending"},
                {"date": "2024-01-07", "amount": "-8000", "description": "Rent", "sequenceNumber": "103"}
            ],
            "hasMore": false
        })))
        .mount(&server)
        .await;

    let config = test_config(&server);
    let browser = login_browser(&config);
    let launcher = MemoryLauncher::new(browser.clone());
    let existing = vec![
        Transaction::new(ymd(2024, 1, 5), -5000, "Prel ACME STORE", "1111:2024-01-05:-5000:acme store"),
        Transaction::new(ymd(2024, 1, 6), -100, "Coffee", "1111:2024-01-06:-100:coffee"),
    ];
    let mut client =
        BankClient::new(config, launcher.clone()).with_existing_transactions(existing);
    let mut events = client.subscribe();

    client
        .initialize(&identity(), "checking", DeviceMode::OtherDevice)
        .await?;
    assert_eq!(client.state(), ClientState::Authenticated);
    assert_eq!(
        client.selected_account().map(|a| a.account_number.as_str()),
        Some("1111")
    );

    let outcome = client
        .fetch_and_reconcile(ymd(2024, 1, 1), ymd(2024, 1, 31))
        .await?;
    let imported: Vec<_> = outcome
        .transactions_to_import
        .iter()
        .map(|t| t.payee_name.as_str())
        .collect();
    assert_eq!(imported, vec!["ACME STORE AB", "Rent"]);
    assert_eq!(outcome.replaced_count, 1);
    assert_eq!(outcome.skipped_count, 1);
    assert!(outcome.errors.is_empty());

    assert_eq!(client.state(), ClientState::Done);
    assert!(browser.is_closed());
    assert_eq!(launcher.launches(), 1);

    let events = drain(&mut events);
    assert_eq!(
        events,
        vec![
            AuthEvent::QrTokenUpdated(QR_TOKEN.to_string()),
            AuthEvent::SameDeviceTokenAvailable(AUTO_START_TOKEN.to_string()),
        ]
    );
    assert_eq!(
        DeepLinkBuilder::default().same_device_link(AUTO_START_TOKEN, None),
        "https://app.bankid.com/?autostarttoken=auto-1&redirect=null"
    );

    client.cleanup().await;
    client.cleanup().await;
    assert_eq!(browser.close_count(), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_account_lists_what_is_available() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_accounts(&server).await;

    let config = test_config(&server);
    let browser = login_browser(&config);
    let mut client = BankClient::new(config, MemoryLauncher::new(browser.clone()));

    let err = client
        .initialize(&identity(), "Holiday fund", DeviceMode::OtherDevice)
        .await
        .unwrap_err();
    match &err {
        BankError::AccountNotFound { criteria, available } => {
            assert_eq!(criteria, "Holiday fund");
            assert_eq!(
                available,
                &vec!["Everyday (1111)".to_string(), "Buffer (2222)".to_string()]
            );
        }
        other => panic!("expected AccountNotFound, got {other:?}"),
    }
    assert_eq!(client.state(), ClientState::Failed);
    assert!(browser.is_closed());
    Ok(())
}

#[tokio::test]
async fn missing_same_device_control_fails_authentication() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let config = test_config(&server);
    // Only the other-device control exists on this page.
    let browser = login_browser(&config);
    let mut client = BankClient::new(config, MemoryLauncher::new(browser.clone()));

    let result = client
        .initialize(&identity(), "Everyday", DeviceMode::SameDevice)
        .await;
    assert!(matches!(result, Err(BankError::Authentication(_))));
    assert_eq!(client.state(), ClientState::Failed);
    assert!(browser.is_closed());

    let again = client
        .initialize(&identity(), "Everyday", DeviceMode::SameDevice)
        .await;
    assert!(matches!(again, Err(BankError::SessionState { .. })));
    Ok(())
}
