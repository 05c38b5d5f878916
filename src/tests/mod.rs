// Test modules for Pure2P NAT
// Unit tests extracted from the corresponding source files

mod helpers;

mod retry_tests;
