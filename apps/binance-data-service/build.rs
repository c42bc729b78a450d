//! Build Script for Binance Data Service
//!
//! The prost/tonic stubs are checked in under `packages/schema-gen/rust/binance`.
//! With the `codegen` feature enabled the stubs are regenerated from
//! `packages/proto/binance` using `buf`.
//!
//! # Panics Policy
//!
//! Build scripts use `.expect()` and panic on failure: there is no caller to
//! propagate errors to, and a panic halts the build with a readable message.
#![allow(clippy::expect_used)]

use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../../packages/proto/binance/");

    // Emit cfg for coverage detection
    if env::var("CARGO_LLVM_COV").is_ok()
        || env::var("LLVM_PROFILE_FILE").is_ok()
        || env::var("RUSTFLAGS")
            .map(|f| f.contains("instrument-coverage"))
            .unwrap_or(false)
    {
        println!("cargo:rustc-cfg=coverage");
    }

    #[cfg(feature = "codegen")]
    codegen::regenerate();
}

#[cfg(feature = "codegen")]
mod codegen {
    use prost::Message;
    use std::{env, fs, path::PathBuf, process::Command};

    pub fn regenerate() {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let proto_root = manifest_dir.join("../../packages/proto");
        let target_dir = manifest_dir.join("../../packages/schema-gen/rust/binance/v1");

        // Use Buf to produce a file descriptor set (avoids requiring protoc in PATH).
        let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
        let descriptor_path = out_dir.join("binance_descriptor.pb");
        let status = Command::new("buf")
            .arg("build")
            .arg("--output")
            .arg(&descriptor_path)
            .current_dir(&proto_root)
            .status()
            .expect("Failed to run buf build");

        assert!(
            status.success(),
            "buf build failed; ensure buf is installed and available in PATH"
        );

        let descriptor_bytes =
            fs::read(&descriptor_path).expect("Failed to read buf descriptor set output");
        let fds = prost_types::FileDescriptorSet::decode(&*descriptor_bytes)
            .expect("Failed to decode descriptor set");

        tonic_prost_build::configure()
            .build_client(true)
            .build_server(true)
            .out_dir(&target_dir)
            .compile_fds(fds)
            .expect("Failed to compile protobuf definitions");
    }
}
