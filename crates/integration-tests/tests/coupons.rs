//! Coupon validation across restarts and logins.

#![allow(clippy::unwrap_used)]

use shopstate_core::{AppliedCoupon, CouponRule, UserId};
use shopstate_integration_tests::{Device, eventually};
use shopstate_storefront::remote::memory::MemoryBackend;
use shopstate_storefront::storage::{GUEST_COUPON_KEY, LocalStorage};

fn backend_with_rules() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.put_rule(CouponRule::new("SAVE10", true, 10).unwrap());
    backend.put_rule(CouponRule::new("VIP20", true, 20).unwrap());
    backend
}

#[tokio::test]
async fn test_deactivated_code_is_dropped_on_restart() {
    let backend = backend_with_rules();
    let device = Device::new(&backend);
    device.start_as_guest().await;
    assert!(device.storefront.coupon().apply("save10").await.unwrap());

    backend.set_rule_active("SAVE10", false);

    let restarted = Device::with_storage(&backend, device.storage.clone());
    restarted.start_as_guest().await;
    let coupon = restarted.storefront.coupon();

    assert_eq!(coupon.code(), "SAVE10");
    assert!(!coupon.is_valid());
    assert_eq!(coupon.percent(), 0);
    assert_eq!(restarted.storage.read(GUEST_COUPON_KEY).unwrap(), None);
}

#[tokio::test]
async fn test_active_code_survives_restart() {
    let backend = backend_with_rules();
    let device = Device::new(&backend);
    device.start_as_guest().await;
    device.storefront.coupon().apply("SAVE10").await.unwrap();

    let restarted = Device::with_storage(&backend, device.storage.clone());
    restarted.start_as_guest().await;

    assert!(restarted.storefront.coupon().is_valid());
    assert_eq!(restarted.storefront.coupon().percent(), 10);
}

#[tokio::test]
async fn test_account_coupon_wins_over_guest_coupon() {
    let backend = backend_with_rules();
    let user = UserId::new("alice");
    backend.coupons().seed(
        &user,
        [AppliedCoupon {
            code: "VIP20".to_string(),
        }],
    );

    let device = Device::new(&backend);
    device.start_as_guest().await;
    device.storefront.coupon().apply("SAVE10").await.unwrap();

    device.sign_in(&user).await;

    let coupon = eventually(device.storefront.coupon().coupon_cell(), |coupon| {
        coupon.code == "VIP20"
    })
    .await;
    assert!(coupon.valid);
    assert_eq!(coupon.percent, 20);
    assert_eq!(backend.coupons().rows(&user)[0].code, "VIP20");
    assert_eq!(device.storage.read(GUEST_COUPON_KEY).unwrap(), None);
}

#[tokio::test]
async fn test_guest_coupon_moves_to_empty_account() {
    let backend = backend_with_rules();
    let user = UserId::new("alice");

    let device = Device::new(&backend);
    device.start_as_guest().await;
    device.storefront.coupon().apply("SAVE10").await.unwrap();

    device.sign_in(&user).await;

    assert_eq!(backend.coupons().rows(&user)[0].code, "SAVE10");
    assert!(device.storefront.coupon().is_valid());
}

#[tokio::test]
async fn test_coupon_applied_on_another_device_is_validated() {
    let backend = backend_with_rules();
    let user = UserId::new("alice");
    let phone = Device::new(&backend);
    let laptop = Device::new(&backend);
    phone.start_as(&user).await;
    laptop.start_as(&user).await;

    phone.storefront.coupon().apply("VIP20").await.unwrap();

    let coupon = eventually(laptop.storefront.coupon().coupon_cell(), |coupon| {
        coupon.valid
    })
    .await;
    assert_eq!(coupon.code, "VIP20");
    assert_eq!(coupon.percent, 20);
}
