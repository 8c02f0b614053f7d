pub mod batchport {
    pub mod v1 {
        tonic::include_proto!("batchport.v1");
    }
}

pub const FILE_DESCRIPTOR_SET: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/batchport_descriptor.bin"));
