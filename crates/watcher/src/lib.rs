pub mod kube_source;

pub use kube_source::KubeSource;
