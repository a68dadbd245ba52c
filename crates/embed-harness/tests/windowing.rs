//! Popup hosting and container close requests in windowing mode.

mod support;

use std::sync::Arc;

use embed_harness::{
    ContainerDelegate, Harness, HarnessConfig, HarnessViewDelegate, InstanceClient, InstanceId,
    InstanceRequest, InstanceView, ResourceResponse, WindowDelegate,
};
use support::Fixture;

/// A client that is not backed by any harness.
struct Detached;

impl InstanceClient for Detached {
    fn instance_created(&self, _id: InstanceId) {}
    fn instance_closing(&self, _id: InstanceId) {}
    fn container_created(&self, _id: InstanceId) {}
    fn container_destroyed(&self, _id: InstanceId) {}
    fn resolve_resource(&self, _url: &str) -> Option<ResourceResponse> {
        None
    }
}

fn client(harness: &Arc<Harness>) -> Arc<dyn InstanceClient> {
    Arc::clone(harness) as Arc<dyn InstanceClient>
}

/// Registers a popup view reporting to `client` and hands it to `opener`.
fn open_popup(
    fixture: &Fixture,
    opener: &Arc<dyn WindowDelegate>,
    client: Arc<dyn InstanceClient>,
    devtools: bool,
) -> bool {
    let delegate = Arc::clone(opener).delegate_for_popup(Arc::clone(&client), devtools);
    let view = fixture
        .ctx
        .engine
        .create_view(&InstanceRequest::new("http://tests/popup"), Arc::clone(&client), delegate)
        .unwrap();
    opener.on_popup_created(view, client, devtools)
}

fn close_all(fixture: &Fixture, harness: &Arc<Harness>) {
    harness.destroy_test();
    fixture.flush_until(|| harness.instance_count() == 0 && harness.container_count() == 0);
}

#[test]
fn popup_delegate_follows_the_owning_harness() {
    let fixture = Fixture::new(HarnessConfig::windowing());
    let opener = fixture.harness();
    let other = fixture.harness();
    let delegate: Arc<dyn WindowDelegate> = HarnessViewDelegate::new(&opener);
    assert_eq!(delegate.harness_id(), Some(opener.id()));

    let same = Arc::clone(&delegate).delegate_for_popup(client(&opener), false);
    assert!(Arc::ptr_eq(&same, &delegate));

    let detached = Arc::clone(&delegate).delegate_for_popup(Arc::new(Detached), true);
    assert!(Arc::ptr_eq(&detached, &delegate));

    let foreign = Arc::clone(&delegate).delegate_for_popup(client(&other), false);
    assert!(!Arc::ptr_eq(&foreign, &delegate));
    assert_eq!(foreign.harness_id(), Some(other.id()));

    for harness in [opener, other] {
        harness.set_destroy_test_expected(false);
        fixture.drop_harness(harness);
    }
    assert!(!fixture.ctx.results.failed(), "{:?}", fixture.ctx.results.failures());
}

#[test]
fn popups_are_hosted_under_their_own_titles() {
    let fixture = Fixture::new(HarnessConfig::windowing());
    let harness = fixture.harness();
    harness.set_signal_completion_when_all_closed(false);
    let delegate: Arc<dyn WindowDelegate> = HarnessViewDelegate::new(&harness);

    assert!(open_popup(&fixture, &delegate, client(&harness), false));
    assert!(open_popup(&fixture, &delegate, client(&harness), true));
    fixture.flush_until(|| harness.container_count() == 2);

    assert_eq!(harness.instance_count(), 2);
    assert_eq!(fixture.ctx.counter.get(), 2);
    assert_eq!(
        fixture.engine.titles(),
        ["EmbedHarness Popup", "EmbedHarness DevTools"]
    );

    close_all(&fixture, &harness);
    assert_eq!(fixture.ctx.counter.get(), 0);
    fixture.drop_harness(harness);
    assert!(!fixture.ctx.results.failed(), "{:?}", fixture.ctx.results.failures());
}

#[test]
fn popup_reports_to_the_harness_of_its_client() {
    let fixture = Fixture::new(HarnessConfig::windowing());
    let opener = fixture.harness();
    let owner = fixture.harness();
    owner.set_signal_completion_when_all_closed(false);
    let delegate: Arc<dyn WindowDelegate> = HarnessViewDelegate::new(&opener);

    assert!(open_popup(&fixture, &delegate, client(&owner), false));
    fixture.flush_until(|| owner.container_count() == 1);

    assert_eq!(owner.instance_count(), 1);
    assert_eq!(opener.instance_count(), 0);
    assert_eq!(opener.container_count(), 0);

    close_all(&fixture, &owner);
    fixture.drop_harness(owner);
    opener.set_destroy_test_expected(false);
    fixture.drop_harness(opener);
    assert!(!fixture.ctx.results.failed(), "{:?}", fixture.ctx.results.failures());
}

#[test]
fn can_close_asks_the_hosted_instance() {
    let fixture = Fixture::new(HarnessConfig::windowing());
    let harness = fixture.harness();

    // Nothing hosted yet: nothing to ask.
    let empty = ContainerDelegate::new(&harness, InstanceView { view: 99 }, "empty");
    assert!(empty.can_close());
    assert!(fixture.engine.events().iter().all(|event| !event.starts_with("try close")));

    harness.create_instance(InstanceRequest::new("http://tests/closable")).unwrap();
    fixture.flush_until(|| harness.container_count() == 1 && harness.instance_count() == 1);
    let id = harness.first_instance_id().unwrap();
    let container = fixture.engine.container_delegate(id).unwrap();
    assert_eq!(container.instance(), Some(id));
    assert_eq!(container.title(), "EmbedHarness");

    fixture.engine.refuse_close(true);
    assert!(!container.can_close());
    fixture.flush_ui();
    assert_eq!(harness.instance_count(), 1);
    assert!(fixture
        .engine
        .events()
        .contains(&format!("try close {id} refused=true")));

    fixture.engine.refuse_close(false);
    assert!(container.can_close());
    fixture.flush_until(|| harness.instance_count() == 0 && harness.container_count() == 0);

    let events = fixture.engine.events();
    let asked = events
        .iter()
        .position(|event| *event == format!("try close {id} refused=false"))
        .unwrap();
    let closing = events
        .iter()
        .position(|event| *event == format!("core closing {id}"))
        .unwrap();
    let destroyed = events
        .iter()
        .position(|event| *event == format!("window destroyed {id}"))
        .unwrap();
    assert!(asked < closing && closing < destroyed, "{events:?}");
    assert_eq!(fixture.ctx.counter.get(), 0);

    harness.set_destroy_test_expected(false);
    fixture.drop_harness(harness);
    assert!(!fixture.ctx.results.failed(), "{:?}", fixture.ctx.results.failures());
}
