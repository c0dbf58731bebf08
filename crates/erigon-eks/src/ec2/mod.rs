//! EC2 building blocks: networks, security groups and user data.

pub mod cidr;
pub mod security_group;
pub mod user_data;
pub mod vpc;

pub use cidr::{parse_network, SubnetTier, SubnetType};
pub use ipnet::Ipv4Net;
pub use security_group::{Peer, Port, SecurityGroup};
pub use user_data::{LinuxUserData, MultipartUserData};
pub use vpc::{SubnetHandle, VpcHandle, VpcProps};
