fn main() {
    println!("cargo::rustc-check-cfg=cfg(tls)");
    #[cfg(feature = "tls-native-tls")]
    println!("cargo:rustc-cfg=tls");
}
