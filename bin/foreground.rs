fn main() {
    foreground_child::main()
}
