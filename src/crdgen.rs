use kube::CustomResourceExt;
use operator::UndermoonCluster;

fn main() {
    print!("{}", serde_yaml::to_string(&UndermoonCluster::crd()).unwrap())
}
