mod identity_resolution;
