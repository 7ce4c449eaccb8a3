// Platform backends: packet capture and socket-to-process mapping

pub mod capture;
pub mod socket_mapper;
