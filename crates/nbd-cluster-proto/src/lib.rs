//! Protocol buffer definitions for the reference object-store image back end.
//!
//! Stands in for a `rados`/`rbd` client: a remote image service addressed by
//! pool and image name, with async read/write/flush RPCs whose return codes
//! carry a POSIX errno convention.

pub mod image {
    tonic::include_proto!("nbd.image");
}
