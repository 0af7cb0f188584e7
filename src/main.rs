fn main() {
    codexmux::run();
}
