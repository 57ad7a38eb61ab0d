//! Whole-file flow: demux into shards, store each, retrieve, remux.

use std::io::Cursor;
use std::time::Duration;

use storj_mux::{FileDemuxer, FileMuxer, MuxerOptions};
use storj_tests::TestNetwork;

#[tokio::test]
async fn test_file_demux_store_retrieve_mux() {
    let mut net = TestNetwork::new();
    let renter = net.add_renter().await;
    let _farmer = net.add_farmer().await;

    // A file split into four 4 KiB shards plus a short tail.
    let file: Vec<u8> = (0..17_000u32).map(|i| (i % 251) as u8).collect();
    let shard_size = 4096u64;

    let mut demuxer = FileDemuxer::from_reader(Cursor::new(file.clone()), shard_size).unwrap();
    let mut stored = Vec::new();
    while let Some(shard) = demuxer.next_shard().await.unwrap() {
        let contract = renter
            .store_shard(&shard.data, 2, Duration::from_secs(3600))
            .await
            .unwrap();
        stored.push((shard.index, *contract.data_hash(), *contract.farmer_id().unwrap()));
    }
    assert_eq!(stored.len(), 5);

    // Pull every shard back and reassemble in index order.
    let mut muxer = FileMuxer::new(MuxerOptions {
        shards: Some(stored.len() as i64),
        length: Some(file.len() as i64),
    })
    .unwrap();

    stored.sort_by_key(|(index, _, _)| *index);
    for (_, hash, farmer_id) in &stored {
        let contact = renter.router().get(farmer_id).unwrap();
        let bytes = renter.retrieve_shard(&contact, *hash).await.unwrap();
        muxer.input(Cursor::new(bytes)).unwrap();
    }

    let reassembled = muxer.read_to_end().await.unwrap();
    assert_eq!(reassembled, file);

    net.shutdown().await;
}
