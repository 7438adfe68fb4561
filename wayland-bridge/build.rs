fn main() {
    // build the client shim
    cc::Build::new().file("src/native/sys/client_log_shim.c").compile("log_shim_client");
    println!("cargo:rerun-if-changed=src/native/sys/client_log_shim.c");
    // build the server shim
    cc::Build::new().file("src/native/sys/server_log_shim.c").compile("log_shim_server");
    println!("cargo:rerun-if-changed=src/native/sys/server_log_shim.c");
}
