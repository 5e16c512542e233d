use kube::CustomResourceExt;
use p47_network_apis::Network;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&Network::crd()).unwrap());
}
