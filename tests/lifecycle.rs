//! End-to-end volume lifecycle against the simulated array, one run per
//! array family, driven through boxed clients as the binary assembles them.

use std::time::Duration;

use rstest::rstest;
use uuid::Uuid;

use emc_blockdevice::metadata::DEFAULT_CONTAINER;
use emc_blockdevice::test_support::{FakeConnector, SimulatedArray};
use emc_blockdevice::{
    ArrayClient, ArrayFamily, BlockDeviceApi, BlockDeviceError, ClusterId, DatasetId,
    ManagedPools, MemoryHashStore, MetadataStore,
};

const GIB: u64 = 1 << 30;
const HOST: &str = "node-a";

type BoxedApi = BlockDeviceApi<Box<dyn ArrayClient>, FakeConnector, MemoryHashStore>;

fn cluster() -> ClusterId {
    ClusterId::new(Uuid::from_u128(0x1a2b_3c4d_5e6f_4a70_8b91_a2b3_c4d5_e6f7))
}

fn api_for(family: ArrayFamily) -> (BoxedApi, SimulatedArray, FakeConnector) {
    let mut array = SimulatedArray::new(family).with_pool("pool-1", "flocker_pool", 1000 * GIB);
    if family == ArrayFamily::ScaleIo {
        array = array.with_fixed_groups();
        array.insert_group(HOST, &[]);
    }
    let connector = FakeConnector::new(HOST);
    let metadata = family
        .requires_metadata()
        .then(|| MetadataStore::new(MemoryHashStore::new(), DEFAULT_CONTAINER));
    let boxed: Box<dyn ArrayClient> = Box::new(array.clone());
    let api = BlockDeviceApi::from_parts(
        boxed,
        connector.clone(),
        cluster(),
        ManagedPools::default(),
        metadata,
    )
    .unwrap_or_else(|err| panic!("api for {family}: {err}"))
    .with_lun_polling(Duration::from_millis(1), Duration::from_millis(200));
    (api, array, connector)
}

#[rstest]
#[case(ArrayFamily::XtremIo)]
#[case(ArrayFamily::Vnx)]
#[case(ArrayFamily::Unity)]
#[case(ArrayFamily::Vmax)]
#[case(ArrayFamily::ScaleIo)]
#[tokio::test]
async fn volume_lifecycle(#[case] family: ArrayFamily) {
    let (api, array, connector) = api_for(family);
    let unit = api.allocation_unit();

    let created = api
        .create_volume(DatasetId::new(Uuid::new_v4()), unit + 1)
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    assert_eq!(created.size_bytes, 2 * unit);
    assert_eq!(created.attached_to, None);
    assert_eq!(created.array_handle.family, family);
    let id = created.blockdevice_id.clone();

    let attached = api
        .attach_volume(&id, HOST)
        .await
        .unwrap_or_else(|err| panic!("attach: {err}"));
    assert_eq!(attached.attached_to.as_deref(), Some(HOST));
    assert!(connector.rescans() >= 1);

    let listed = api
        .list_volumes()
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));
    let found = listed
        .iter()
        .find(|volume| volume.blockdevice_id == id)
        .unwrap_or_else(|| panic!("created volume should be listed"));
    assert_eq!(found.attached_to.as_deref(), Some(HOST));

    let path = api
        .get_device_path(&id)
        .await
        .unwrap_or_else(|err| panic!("device path: {err}"));
    assert!(path.as_str().starts_with("/dev/"), "path: {path}");

    let busy = api.destroy_volume(&id).await;
    assert!(
        matches!(busy, Err(BlockDeviceError::AlreadyAttachedVolume { .. })),
        "destroy while attached: {busy:?}"
    );

    api.detach_volume(&id)
        .await
        .unwrap_or_else(|err| panic!("detach: {err}"));
    let resized = api
        .resize_volume(&id, 3 * unit)
        .await
        .unwrap_or_else(|err| panic!("resize: {err}"));
    assert_eq!(resized.size_bytes, 3 * unit);

    api.destroy_volume(&id)
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));
    assert!(array.lun_names().is_empty());
    let remaining = api
        .list_volumes()
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));
    assert!(remaining.iter().all(|volume| volume.blockdevice_id != id));
}

#[rstest]
#[case(ArrayFamily::Vmax)]
#[case(ArrayFamily::ScaleIo)]
fn metadata_families_refuse_to_run_without_a_store(#[case] family: ArrayFamily) {
    let boxed: Box<dyn ArrayClient> = Box::new(SimulatedArray::new(family));
    let result = BlockDeviceApi::<_, _, MemoryHashStore>::from_parts(
        boxed,
        FakeConnector::new(HOST),
        cluster(),
        ManagedPools::default(),
        None,
    );
    assert!(
        matches!(result, Err(BlockDeviceError::ConfigurationError { .. })),
        "{family} should need a metadata store"
    );
}

#[rstest]
#[case(ArrayFamily::XtremIo)]
#[case(ArrayFamily::Vnx)]
#[case(ArrayFamily::Unity)]
fn name_families_refuse_a_store(#[case] family: ArrayFamily) {
    let boxed: Box<dyn ArrayClient> = Box::new(SimulatedArray::new(family));
    let result = BlockDeviceApi::from_parts(
        boxed,
        FakeConnector::new(HOST),
        cluster(),
        ManagedPools::default(),
        Some(MetadataStore::new(MemoryHashStore::new(), DEFAULT_CONTAINER)),
    );
    assert!(
        matches!(result, Err(BlockDeviceError::ConfigurationError { .. })),
        "{family} should not take a metadata store"
    );
}
