//! tonic 连接工厂与负载均衡 Channel 测试

use flare_client_core::balancer::{BalancedChannel, Connection, Connector, Picker, TonicConnector};
use flare_client_core::{BalancerConfig, ClientConfig, FlareError};
use std::sync::Arc;
use tonic::body::Body;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tower::ServiceExt;

/// 测试：按地址创建惰性 Channel
#[tokio::test]
async fn test_tonic_connector() {
    let connector = TonicConnector::new(ClientConfig::default());
    let channel = connector.connect("127.0.0.1:50051").await.unwrap();
    assert!(channel.is_ready());

    assert!(matches!(
        connector.connect("not a valid address").await,
        Err(FlareError::Connection(_))
    ));
}

/// 测试：没有后端时请求以 Unavailable 失败
#[tokio::test]
async fn test_balanced_channel_without_backends() {
    let picker: Arc<Picker<Channel>> =
        Arc::new(Picker::new("signaling-online", &BalancerConfig::default()));
    let channel = BalancedChannel::new(picker, 3);

    let request = http::Request::builder()
        .uri("http://signaling-online/flare.Signaling/Login")
        .header("x-shard-key", "user-1")
        .body(Body::empty())
        .unwrap();

    let err = channel.oneshot(request).await.unwrap_err();
    let status = err.downcast::<Status>().unwrap();
    assert_eq!(status.code(), Code::Unavailable);
}

/// 测试：Channel 共享同一个选择器
#[tokio::test]
async fn test_balanced_channel_shares_picker() {
    let connector = TonicConnector::default();
    let picker = Arc::new(Picker::new("signaling-online", &BalancerConfig::default()));
    picker.rebuild(vec![(
        "127.0.0.1:50051".to_string(),
        connector.connect("127.0.0.1:50051").await.unwrap(),
    )]);

    let channel = BalancedChannel::new(picker.clone(), 3);
    let cloned = channel.clone();
    assert!(Arc::ptr_eq(channel.picker(), cloned.picker()));
    assert_eq!(channel.picker().snapshot().len(), 1);
}
