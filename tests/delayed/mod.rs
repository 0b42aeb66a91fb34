mod purgatory_tests;
