// wsbroker-common: wire types shared by the broker, its clients and collaborators

pub mod protocol;
pub mod types;
